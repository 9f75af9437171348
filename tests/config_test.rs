use std::time::Duration;

use tandem_rs::config::Config;
use tandem_rs::config::secrets::ExposeSecret;

// Environment variables are process-global, so every case runs in one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("TANDEM_REQUEST_TTL_SECS");
    }
    assert!(Config::from_env().is_err(), "REDIS_URL is required");

    unsafe {
        std::env::set_var("REDIS_URL", "redis://127.0.0.1:6379");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.redis_url.expose_secret(), "redis://127.0.0.1:6379");
    assert!(!config.log_level.is_empty());
    assert_eq!(config.request_ttl, None);
    assert_eq!(config.channel_config().request_ttl, None);

    unsafe {
        std::env::set_var("TANDEM_REQUEST_TTL_SECS", "30");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.request_ttl, Some(Duration::from_secs(30)));
    assert_eq!(
        config.channel_config().request_ttl,
        Some(Duration::from_secs(30))
    );

    for bad in ["0", "soon", "-5"] {
        unsafe {
            std::env::set_var("TANDEM_REQUEST_TTL_SECS", bad);
        }
        assert!(Config::from_env().is_err(), "{bad} should be rejected");
    }

    unsafe {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("TANDEM_REQUEST_TTL_SECS");
    }
}
