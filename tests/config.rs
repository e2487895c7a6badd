use rpx::balancing::BalancingAlgorithm;
use rpx::{Config, SchedulingMode, BACKEND_ADDRESS, BASE_PORT, MAX_BACKENDS, MAX_FAILURES};
use std::io::Write;
use std::path::PathBuf;

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn config_defaults_test() {
    // An empty document leaves every field at the stock deployment values.
    let path = write_temp("rpx_config_defaults.yaml", "{}");
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.listen_on(), "0.0.0.0:8080");
    assert_eq!(config.mode(), SchedulingMode::Reactor);
    assert_eq!(config.balancing_algorithm(), &BalancingAlgorithm::RoundRobin);
    assert_eq!(config.max_failures(), MAX_FAILURES);

    let backends = config.backends();
    assert_eq!(backends.len(), MAX_BACKENDS);
    assert_eq!(backends[0].address, BACKEND_ADDRESS);
    assert_eq!(backends[0].port, BASE_PORT);
    assert_eq!(backends[MAX_BACKENDS - 1].port, BASE_PORT + MAX_BACKENDS as u16 - 1);
}

#[test]
fn config_overrides_test() {
    let yaml = "\
listen_port: 9000
backend_address: \"127.0.0.1\"
base_port: 7000
max_backends: 2
balancing: least-connections
mode: worker-pool
num_threads: 8
timeout: 250
";
    let path = write_temp("rpx_config_overrides.yaml", yaml);
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.listen_port(), 9000);
    assert_eq!(config.mode(), SchedulingMode::WorkerPool);
    assert_eq!(
        config.balancing_algorithm(),
        &BalancingAlgorithm::LeastConnections
    );
    assert_eq!(config.num_threads(), 8);
    assert_eq!(config.timeout(), std::time::Duration::from_millis(250));

    let backends = config.backends();
    assert_eq!(backends.len(), 2);
    assert_eq!(backends[0].address, "127.0.0.1");
    assert_eq!(backends[1].port, 7001);
}

#[test]
fn config_missing_file_test() {
    assert!(Config::from_file("/nonexistent/rpx.yaml").is_err());
}
