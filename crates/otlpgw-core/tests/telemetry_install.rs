//! 独立测试二进制：全局订阅器在进程内只能设置一次，不能与其它使用 `tracing-test` 的用例混跑。

use otlpgw_core::telemetry::{TelemetryError, install_tracing, is_installed};

#[test]
fn second_install_is_rejected() {
    assert!(!is_installed());
    install_tracing("info,otlpgw_core=debug").expect("first install");
    assert!(is_installed());
    match install_tracing("debug") {
        Err(TelemetryError::AlreadyInstalled(directive)) => {
            assert_eq!(directive, "info,otlpgw_core=debug");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    tracing::info!("subscriber installed");
}
