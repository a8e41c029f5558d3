use panic_recovery::{init, FailureValue, LoggingConfig, RecoveryConfig, RecoveryError};

#[test]
fn test_init_returns_working_handler() {
    let config = RecoveryConfig {
        logging: LoggingConfig {
            level: "error".to_string(),
            service_name: "init-test".to_string(),
            json_format: false,
            ..LoggingConfig::default()
        },
        ..RecoveryConfig::default()
    };

    let handler = init(&config).unwrap();
    assert_eq!(handler(FailureValue::from("boom")), RecoveryError);

    // Second initialization is a no-op
    let handler = init(&config).unwrap();
    assert_eq!(handler(FailureValue::Nil), RecoveryError);
}
