use egress_warden::AppConfig;

#[test]
fn zero_tick_ms_is_rejected() {
    let mut cfg = AppConfig::default();
    cfg.monitor.tick_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn zero_staleness_is_rejected() {
    let mut cfg = AppConfig::default();
    cfg.monitor.staleness_secs = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn zero_domain_refresh_interval_is_rejected() {
    let mut cfg = AppConfig::default();
    cfg.monitor.domain_refresh_every_ticks = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn unparseable_proxy_listen_address_is_rejected() {
    let mut cfg = AppConfig::default();
    cfg.proxy.listen = "not-a-socket-addr".to_owned();
    assert!(cfg.validate().is_err());
}

#[test]
fn defaults_are_valid() {
    AppConfig::default().validate().expect("defaults must validate");
}
