use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use panic_recovery::{
    new_panic_handler, recover, recover_async, FailureValue, MemoryLogger, RecoveryError,
    RecoveryHandlerFunc, PANIC_LOG_MESSAGE,
};

#[test]
fn test_concurrent_invocations_are_paired() {
    let logger = Arc::new(MemoryLogger::new());
    let handler = new_panic_handler(logger.clone());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let handler = handler.clone();
            thread::spawn(move || handler(FailureValue::from(format!("request {} failed", i))))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), RecoveryError);
    }

    let entries = logger.entries();
    assert_eq!(entries.len(), 16);

    let seen: HashSet<String> = entries
        .iter()
        .map(|entry| entry.attr("panic").unwrap().to_string())
        .collect();
    assert_eq!(seen.len(), 16);
    for i in 0..16 {
        assert!(seen.contains(&format!("request {} failed", i)));
    }

    for entry in &entries {
        assert_eq!(entry.message, PANIC_LOG_MESSAGE);
        assert!(!entry.stack.as_ref().unwrap().is_empty());
    }
}

#[inline(never)]
fn recover_first_request(handler: &RecoveryHandlerFunc) -> Result<u32, RecoveryError> {
    recover(handler, || -> u32 { panic!("first: nil map write") })
}

#[inline(never)]
fn recover_second_request(handler: &RecoveryHandlerFunc) -> Result<u32, RecoveryError> {
    recover(handler, || -> u32 { panic!("second: slice bounds") })
}

#[test]
fn test_two_concurrent_panics_keep_their_own_values() {
    let logger = Arc::new(MemoryLogger::new());
    let handler = new_panic_handler(logger.clone());

    let first = {
        let handler = handler.clone();
        thread::spawn(move || recover_first_request(&handler))
    };
    let second = {
        let handler = handler.clone();
        thread::spawn(move || recover_second_request(&handler))
    };

    assert_eq!(first.join().unwrap(), Err(RecoveryError));
    assert_eq!(second.join().unwrap(), Err(RecoveryError));

    let mut entries = logger.entries();
    entries.sort_by_key(|entry| entry.failure.as_ref().unwrap().to_string());
    let values: Vec<String> = entries
        .iter()
        .map(|entry| entry.failure.as_ref().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["first: nil map write", "second: slice bounds"]);

    // Each value comes with the stack of the thread that recovered it
    let first_stack = entries[0].stack.as_ref().unwrap();
    let second_stack = entries[1].stack.as_ref().unwrap();
    assert!(!first_stack.is_empty());
    assert!(!second_stack.is_empty());
    assert!(!std::ptr::eq(first_stack.frames(), second_stack.frames()));

    let first_rendered = first_stack.to_string();
    let second_rendered = second_stack.to_string();
    assert!(first_rendered.contains("recover_first_request"));
    assert!(!first_rendered.contains("recover_second_request"));
    assert!(second_rendered.contains("recover_second_request"));
    assert!(!second_rendered.contains("recover_first_request"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_task_does_not_affect_siblings() {
    let logger = Arc::new(MemoryLogger::new());
    let handler = new_panic_handler(logger.clone());

    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            recover_async(&handler, async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if i % 2 == 0 {
                    panic!("task {} hit a bug", i);
                }
                i * 10
            })
            .await
        }));
    }

    let mut ok = Vec::new();
    let mut failed = 0;
    for task in tasks {
        // Every task completes; none is torn down by a panic
        match task.await.unwrap() {
            Ok(value) => ok.push(value),
            Err(err) => {
                assert_eq!(err.to_string(), "rpc: panic serving request");
                failed += 1;
            }
        }
    }

    ok.sort();
    assert_eq!(ok, vec![10, 30, 50, 70]);
    assert_eq!(failed, 4);
    assert_eq!(logger.len(), 4);
}

#[test]
fn test_error_message_never_leaks_payload() {
    let logger = Arc::new(MemoryLogger::new());
    let handler = new_panic_handler(logger.clone());

    let secret = "password=hunter2 at 10.0.0.12";
    let result: Result<(), _> = recover(&handler, || panic!("{}", secret));

    let err = result.unwrap_err();
    assert!(!err.to_string().contains("hunter2"));
    assert!(logger.entries()[0].attr("panic").unwrap().contains("hunter2"));
}
