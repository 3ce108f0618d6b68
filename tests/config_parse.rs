use egress_warden::AppConfig;

#[test]
fn example_config_parses_and_validates() {
    let raw = include_str!("../config/config.example.toml");
    let cfg: AppConfig = toml::from_str(raw).expect("config.example.toml must parse");
    cfg.validate().expect("config.example.toml must validate");
    assert_eq!(cfg.monitor.tick_ms, 1000);
    assert_eq!(cfg.proxy.listen, "127.0.0.1:8443");
}

#[test]
fn missing_sections_fall_back_to_defaults() {
    let cfg: AppConfig = toml::from_str("").expect("empty config must parse with defaults");
    cfg.validate().expect("defaults must validate");
}
