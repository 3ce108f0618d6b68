use egress_warden::ipc::{
    AddRuleRequest, Request, Response, RuleInfo, StatusResponse, read_json_line, write_json_line,
};

#[test]
fn request_response_roundtrip_over_a_buffer() {
    let req = Request::AddRule(AddRuleRequest {
        app: "firefox".to_owned(),
        target: "ads.example.com".to_owned(),
    });

    let mut wire = Vec::new();
    write_json_line(&mut wire, &req).expect("serialize request");

    let decoded: Request = read_json_line(&wire[..]).expect("deserialize request");
    match decoded {
        Request::AddRule(r) => {
            assert_eq!(r.app, "firefox");
            assert_eq!(r.target, "ads.example.com");
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[test]
fn list_active_response_roundtrips() {
    let resp = Response::OkListActive {
        rules: vec![RuleInfo {
            id: 1,
            app: "curl".to_owned(),
            target: "8.8.8.8".to_owned(),
            target_kind: "ip".to_owned(),
            resolved_ips: vec!["8.8.8.8".to_owned()],
            created_at: "2026-01-01 00:00:00".to_owned(),
        }],
    };

    let mut wire = Vec::new();
    write_json_line(&mut wire, &resp).unwrap();
    let decoded: Response = read_json_line(&wire[..]).unwrap();
    match decoded {
        Response::OkListActive { rules } => assert_eq!(rules.len(), 1),
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[test]
fn status_response_roundtrips() {
    let resp = Response::OkStatus(StatusResponse {
        uptime_ms: 12345,
        config_path: "config.toml".to_owned(),
        socket: "wardend.sock".to_owned(),
        active_rule_count: 3,
        running: true,
    });

    let mut wire = Vec::new();
    write_json_line(&mut wire, &resp).unwrap();
    let decoded: Response = read_json_line(&wire[..]).unwrap();
    match decoded {
        Response::OkStatus(s) => assert_eq!(s.active_rule_count, 3),
        other => panic!("unexpected variant: {other:?}"),
    }
}
