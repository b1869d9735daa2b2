//! Field and method descriptor parsing.

use crate::base_type::BaseType;
use crate::error::Error::{InvalidFieldTypeDescriptor, InvalidMethodDescriptor};
use crate::error::Result;
use std::fmt;

/// The type of a field, parameter or return value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldType {
    Base(BaseType),
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a field descriptor such as `I`, `Ljava/lang/String;` or `[[B`.
    ///
    /// # Errors
    /// Returns `InvalidFieldTypeDescriptor` on malformed input.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut chars = descriptor.chars();
        let field_type = Self::parse_chars(&mut chars)
            .ok_or_else(|| InvalidFieldTypeDescriptor(descriptor.to_string()))?;
        if chars.next().is_some() {
            return Err(InvalidFieldTypeDescriptor(descriptor.to_string()));
        }
        Ok(field_type)
    }

    fn parse_chars(chars: &mut std::str::Chars<'_>) -> Option<Self> {
        match chars.next()? {
            'L' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        ';' => break,
                        ch => name.push(ch),
                    }
                }
                Some(FieldType::Object(name))
            }
            '[' => Some(FieldType::Array(Box::new(Self::parse_chars(chars)?))),
            code => BaseType::parse(code).ok().map(FieldType::Base),
        }
    }

    /// Whether values of this type are heap references.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    /// Width of a value of this type in 32-bit stack slots.
    #[must_use]
    pub fn slots(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.slots(),
            _ => 1,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Base(base_type) => write!(f, "{}", base_type.code()),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(component) => write!(f, "[{component}"),
        }
    }
}

/// A parsed method descriptor: parameter types and return type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    /// Parse a method descriptor such as `(ILjava/lang/String;)V`.
    ///
    /// # Errors
    /// Returns `InvalidMethodDescriptor` on malformed input.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let error = || InvalidMethodDescriptor(descriptor.to_string());
        let mut chars = descriptor.chars();
        if chars.next() != Some('(') {
            return Err(error());
        }

        let mut parameters = Vec::new();
        let mut rest = chars.as_str();
        while !rest.starts_with(')') {
            let mut chars = rest.chars();
            let parameter = FieldType::parse_chars(&mut chars).ok_or_else(error)?;
            parameters.push(parameter);
            rest = chars.as_str();
            if rest.is_empty() {
                return Err(error());
            }
        }

        let return_descriptor = &rest[1..];
        let return_type = if return_descriptor == "V" {
            None
        } else {
            Some(FieldType::parse(return_descriptor).map_err(|_| error())?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }

    /// Number of 32-bit argument slots, excluding any receiver.
    #[must_use]
    pub fn parameter_slots(&self) -> usize {
        self.parameters.iter().map(FieldType::slots).sum()
    }

    /// Number of 32-bit slots the return value occupies.
    #[must_use]
    pub fn return_slots(&self) -> usize {
        self.return_type.as_ref().map_or(0, FieldType::slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_types() -> Result<()> {
        assert_eq!(FieldType::parse("I")?, FieldType::Base(BaseType::Int));
        assert_eq!(
            FieldType::parse("Ljava/lang/String;")?,
            FieldType::Object("java/lang/String".to_string())
        );
        assert_eq!(
            FieldType::parse("[[B")?,
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Base(
                BaseType::Byte
            )))))
        );
        Ok(())
    }

    #[test]
    fn test_parse_field_type_invalid() {
        assert!(FieldType::parse("").is_err());
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("Q").is_err());
    }

    #[test]
    fn test_field_type_display() -> Result<()> {
        for descriptor in ["I", "Ljava/lang/Object;", "[[J"] {
            assert_eq!(FieldType::parse(descriptor)?.to_string(), descriptor);
        }
        Ok(())
    }

    #[test]
    fn test_parse_method_descriptor() -> Result<()> {
        let descriptor = MethodDescriptor::parse("(IJLjava/lang/String;[B)V")?;
        assert_eq!(descriptor.parameters.len(), 4);
        assert_eq!(descriptor.return_type, None);
        assert_eq!(descriptor.parameter_slots(), 5);
        assert_eq!(descriptor.return_slots(), 0);

        let descriptor = MethodDescriptor::parse("(I)J")?;
        assert_eq!(descriptor.return_slots(), 2);
        Ok(())
    }

    #[test]
    fn test_parse_method_descriptor_invalid() {
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("(I)").is_err());
        assert!(MethodDescriptor::parse("(I)VV").is_err());
    }
}
