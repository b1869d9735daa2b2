//! Two green threads alternating notify/wait over one lock object.

mod common;

use common::{class_bytes, find_method, int_result, make_vm, MethodSpec};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::{ConstantPool, StackMapFrame, VerificationType};
use kelvin_vm::Result;

#[test_log::test]
fn test_monitor_ping_pong() -> Result<()> {
    let (mut vm, _host) = make_vm(64 * 1024, false)?;

    let mut constant_pool = ConstantPool::new();
    let worker_class = constant_pool.add_class("Worker").expect("class");
    let object_class = constant_pool.add_class("java/lang/Object").expect("class");
    let counter_ref = constant_pool
        .add_field_ref("Worker", "counter", "I")
        .expect("field ref");
    let lock_ref = constant_pool
        .add_field_ref("Worker", "lock", "Ljava/lang/Object;")
        .expect("field ref");
    let object_init = constant_pool
        .add_method_ref("java/lang/Object", "<init>", "()V")
        .expect("method ref");
    let thread_init = constant_pool
        .add_method_ref("java/lang/Thread", "<init>", "()V")
        .expect("method ref");
    let worker_init = constant_pool
        .add_method_ref("Worker", "<init>", "()V")
        .expect("method ref");
    let notify_ref = constant_pool
        .add_method_ref("java/lang/Object", "notify", "()V")
        .expect("method ref");
    let wait_ref = constant_pool
        .add_method_ref("java/lang/Object", "wait", "(J)V")
        .expect("method ref");
    let start_ref = constant_pool
        .add_method_ref("Worker", "start", "()V")
        .expect("method ref");
    let active_ref = constant_pool
        .add_method_ref("java/lang/Thread", "activeCount", "()I")
        .expect("method ref");
    let yield_ref = constant_pool
        .add_method_ref("java/lang/Thread", "yield", "()V")
        .expect("method ref");

    let [counter_hi, counter_lo] = counter_ref.to_be_bytes();
    let [lock_hi, lock_lo] = lock_ref.to_be_bytes();
    let [oinit_hi, oinit_lo] = object_init.to_be_bytes();
    let [tinit_hi, tinit_lo] = thread_init.to_be_bytes();
    let [winit_hi, winit_lo] = worker_init.to_be_bytes();
    let [notify_hi, notify_lo] = notify_ref.to_be_bytes();
    let [wait_hi, wait_lo] = wait_ref.to_be_bytes();
    let [start_hi, start_lo] = start_ref.to_be_bytes();
    let [active_hi, active_lo] = active_ref.to_be_bytes();
    let [yield_hi, yield_lo] = yield_ref.to_be_bytes();
    let [objcls_hi, objcls_lo] = object_class.to_be_bytes();

    // static { lock = new Object(); }
    let clinit = MethodSpec {
        max_stack: 2,
        max_locals: 0,
        code: vec![
            NEW, objcls_hi, objcls_lo,          //  0
            DUP,                                //  3
            INVOKESPECIAL, oinit_hi, oinit_lo,  //  4
            PUTSTATIC, lock_hi, lock_lo,        //  7
            RETURN,                             // 10
        ],
        ..MethodSpec::new("<clinit>", "()V")
    };

    // Worker() { super(); }
    let init = MethodSpec {
        is_static: false,
        max_stack: 1,
        max_locals: 1,
        code: vec![ALOAD_0, INVOKESPECIAL, tinit_hi, tinit_lo, RETURN],
        ..MethodSpec::new("<init>", "()V")
    };

    // public void run() {
    //     for (int i = 0; i < 100; i++) {
    //         synchronized (lock) {
    //             counter++;
    //             lock.notify();
    //             if (counter < 200) lock.wait(0);
    //         }
    //     }
    // }
    let run = MethodSpec {
        is_static: false,
        max_stack: 3,
        max_locals: 3,
        code: vec![
            ICONST_0,                              //  0
            ISTORE_1,                              //  1
            GOTO, 0, 40,                           //  2 -> 42
            GETSTATIC, lock_hi, lock_lo,           //  5
            DUP,                                   //  8
            ASTORE_2,                              //  9
            MONITORENTER,                          // 10
            GETSTATIC, counter_hi, counter_lo,     // 11
            ICONST_1,                              // 14
            IADD,                                  // 15
            PUTSTATIC, counter_hi, counter_lo,     // 16
            ALOAD_2,                               // 19
            INVOKEVIRTUAL, notify_hi, notify_lo,   // 20
            GETSTATIC, counter_hi, counter_lo,     // 23
            SIPUSH, 0, 200,                        // 26
            IF_ICMPGE, 0, 8,                       // 29 -> 37
            ALOAD_2,                               // 32
            LCONST_0,                              // 33
            INVOKEVIRTUAL, wait_hi, wait_lo,       // 34
            ALOAD_2,                               // 37
            MONITOREXIT,                           // 38
            IINC, 1, 1,                            // 39
            ILOAD_1,                               // 42
            BIPUSH, 100,                           // 43
            IF_ICMPLT, 0xFF, 0xD8,                 // 45 -> 5 (-40)
            RETURN,                                // 48
        ],
        stack_map: vec![
            StackMapFrame {
                offset: 5,
                locals: vec![
                    VerificationType::Object { class_index: worker_class },
                    VerificationType::Integer,
                    VerificationType::Top,
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 37,
                locals: vec![
                    VerificationType::Object { class_index: worker_class },
                    VerificationType::Integer,
                    VerificationType::Object { class_index: object_class },
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 42,
                locals: vec![
                    VerificationType::Object { class_index: worker_class },
                    VerificationType::Integer,
                    VerificationType::Top,
                ],
                stack: vec![],
            },
        ],
        ..MethodSpec::new("run", "()V")
    };

    // static int test() {
    //     Worker a = new Worker(); Worker b = new Worker();
    //     a.start(); b.start();
    //     while (Thread.activeCount() > 1) Thread.yield();
    //     return counter;
    // }
    let worker_class_bytes = worker_class.to_be_bytes();
    let test = MethodSpec {
        max_stack: 2,
        max_locals: 2,
        code: vec![
            NEW, worker_class_bytes[0], worker_class_bytes[1], //  0
            DUP,                                               //  3
            INVOKESPECIAL, winit_hi, winit_lo,                 //  4
            ASTORE_0,                                          //  7
            NEW, worker_class_bytes[0], worker_class_bytes[1], //  8
            DUP,                                               // 11
            INVOKESPECIAL, winit_hi, winit_lo,                 // 12
            ASTORE_1,                                          // 15
            ALOAD_0,                                           // 16
            INVOKEVIRTUAL, start_hi, start_lo,                 // 17
            ALOAD_1,                                           // 20
            INVOKEVIRTUAL, start_hi, start_lo,                 // 21
            INVOKESTATIC, active_hi, active_lo,                // 24
            ICONST_1,                                          // 27
            IF_ICMPLE, 0, 9,                                   // 28 -> 37
            INVOKESTATIC, yield_hi, yield_lo,                  // 31
            GOTO, 0xFF, 0xF6,                                  // 34 -> 24 (-10)
            GETSTATIC, counter_hi, counter_lo,                 // 37
            IRETURN,                                           // 40
        ],
        stack_map: vec![
            StackMapFrame {
                offset: 24,
                locals: vec![
                    VerificationType::Object { class_index: worker_class },
                    VerificationType::Object { class_index: worker_class },
                ],
                stack: vec![],
            },
            StackMapFrame {
                offset: 37,
                locals: vec![
                    VerificationType::Object { class_index: worker_class },
                    VerificationType::Object { class_index: worker_class },
                ],
                stack: vec![],
            },
        ],
        ..MethodSpec::new("test", "()I")
    };

    let bytes = class_bytes(
        constant_pool,
        "Worker",
        "java/lang/Thread",
        &["counter"],
        &["lock"],
        &[clinit, init, run, test],
    );
    let class_id = vm.define_class("Worker", bytes)?;
    let test_method = find_method(&mut vm, class_id, "test", "()I");

    let result = vm.invoke_static(class_id, test_method)?;
    assert!(!vm.saw_uncaught_exception(), "ping-pong threw");
    assert_eq!(int_result(&result), 200);
    Ok(())
}
