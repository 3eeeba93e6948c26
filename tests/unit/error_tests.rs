use agent_session_runner::AppError;

#[test]
fn display_prefixes_identify_the_variant() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Spawn("x".into()), "spawn: x"),
        (AppError::Protocol("x".into()), "protocol: x"),
        (AppError::NotIdle("x".into()), "not idle: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::AlreadyRunning("x".into()), "already running: x"),
        (AppError::CapacityExceeded("x".into()), "capacity exceeded: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_errors_convert_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(msg) if msg.contains("denied")));
}

#[test]
fn json_errors_convert_to_persistence_variant() {
    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: AppError = json.into();
    assert!(err.to_string().starts_with("persistence: json:"));
}
