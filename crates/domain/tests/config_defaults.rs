use cb_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 4520);
}

#[test]
fn explicit_bind_host_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 4520
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn partial_sections_keep_other_defaults() {
    let toml_str = r#"
[turns]
stall_threshold_sec = 60
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.turns.stall_threshold_sec, 60);
    assert_eq!(config.turns.stall_heartbeat_sec, 10);
    assert_eq!(config.limits.conn_outbox_size, 256);
}
