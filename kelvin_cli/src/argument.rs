use clap::Parser;

/// Command line arguments, shaped like the traditional launcher.
#[derive(Debug, Parser)]
#[command(name = "kelvin", about = "Run a Java class on the Kelvin VM", version)]
pub(crate) struct Arguments {
    /// Class search path of directories and JAR archives
    #[arg(long = "classpath", short = 'c', alias = "cp")]
    pub classpath: Option<String>,

    /// Heap size in cells (4-byte words)
    #[arg(long = "heap-cells")]
    pub heap_cells: Option<usize>,

    /// Collect before every allocation (debug stress mode)
    #[arg(long = "stress-gc", default_value_t = false)]
    pub stress_gc: bool,

    /// The class whose main method should run
    pub mainclass: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true)]
    pub parameters: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_main_class_and_parameters() {
        let arguments =
            Arguments::parse_from(["kelvin", "-c", "lib.jar", "Main", "one", "two"]);
        assert_eq!(arguments.classpath.as_deref(), Some("lib.jar"));
        assert_eq!(arguments.mainclass, "Main");
        assert_eq!(arguments.parameters, vec!["one", "two"]);
    }

    #[test]
    fn test_parse_heap_cells() {
        let arguments = Arguments::parse_from(["kelvin", "--heap-cells", "32768", "Main"]);
        assert_eq!(arguments.heap_cells, Some(32768));
        assert!(!arguments.stress_gc);
    }
}
