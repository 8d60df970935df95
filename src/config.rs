use crate::prelude::*;

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub modbus: Modbus,

    #[serde(default = "Config::default_mqtt")]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_broadcast")]
    pub broadcast: Broadcast,

    pub interval_secs: Option<u64>,
    pub log_query: Option<bool>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Modbus {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Modbus {
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default = "Config::default_modbus_port")]
    pub port: u16,
    pub slave_id: Option<u8>,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    pub request_timeout_ms: Option<u64>,
    pub login_delay_ms: Option<u64>,
    pub login_timeout_secs: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
    pub query_device_info: Option<bool>,
}
impl Modbus {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id.unwrap_or(1)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(5000))
    }

    pub fn login_delay(&self) -> Duration {
        Duration::from_millis(self.login_delay_ms.unwrap_or(1000))
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs.unwrap_or(15))
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }

    pub fn query_device_info(&self) -> bool {
        self.query_device_info == Some(true)
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_broker")]
    pub broker: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "Config::default_mqtt_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,

    pub qos: Option<u8>,
    pub retain: Option<bool>,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn qos(&self) -> u8 {
        self.qos.unwrap_or(0)
    }

    pub fn retain(&self) -> bool {
        self.retain == Some(true)
    }

    /// Broker host and port, from `tcp://host:port` or a bare `host:port`.
    pub fn broker_addr(&self) -> Result<(String, u16)> {
        let with_scheme = if self.broker.contains("://") {
            self.broker.clone()
        } else {
            format!("tcp://{}", self.broker)
        };
        let url = url::Url::parse(&with_scheme)
            .map_err(|err| anyhow!("invalid mqtt broker {}: {}", self.broker, err))?;

        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("mqtt broker {} has no host", self.broker))?
            .to_string();

        Ok((host, url.port().unwrap_or(1883)))
    }
} // }}}

// Broadcast {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Broadcast {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub destination_ip: Option<Ipv4Addr>,
    pub self_ip: Option<Ipv4Addr>,
}
impl Broadcast {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn destination_ip(&self) -> Ipv4Addr {
        self.destination_ip.unwrap_or(Ipv4Addr::BROADCAST)
    }

    pub fn self_ip(&self) -> Option<Ipv4Addr> {
        self.self_ip
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let document: serde_yaml::Value = serde_yaml::from_str(&content)?;
        for section in Self::missing_sections(&document) {
            warn!("no {} section in {}, {} is disabled", section, file, section);
        }
        let config: Self = serde_yaml::from_value(document)?;

        info!("Configuration loaded successfully:");
        info!("  Modbus:");
        info!("    Host: {}", config.modbus.host);
        info!("    Port: {}", config.modbus.port);
        info!("    Slave ID: {}", config.modbus.slave_id());
        info!("    Username: {}", config.modbus.username);
        info!("    Request Timeout: {:?}", config.modbus.request_timeout());
        info!("    Login Delay: {:?}", config.modbus.login_delay());
        info!("    TCP NoDelay: {}", config.modbus.use_tcp_nodelay());

        info!("  MQTT: {}", if config.mqtt.enabled { "enabled" } else { "disabled" });
        if config.mqtt.enabled {
            info!("    Broker: {}", config.mqtt.broker);
            info!("    Topic: {}", config.mqtt.topic);
            info!("    Client ID: {}", config.mqtt.client_id);
            info!("    QoS: {}", config.mqtt.qos());
        }

        info!("  Broadcast: {}", if config.broadcast.enabled { "enabled" } else { "disabled" });
        if config.broadcast.enabled {
            info!("    Destination: {}", config.broadcast.destination_ip());
            info!(
                "    Self: {}",
                config.broadcast.self_ip.map(|ip| ip.to_string()).unwrap_or_default()
            );
        }

        info!("  Interval: {:?}", config.interval());
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    /// Optional sections absent from the document; each one turns its feature off.
    fn missing_sections(document: &serde_yaml::Value) -> Vec<&'static str> {
        ["mqtt", "broadcast"]
            .into_iter()
            .filter(|section| document.get(section).is_none())
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.modbus.host.is_empty() {
            bail!("modbus.host cannot be empty");
        }
        if self.modbus.port == 0 {
            bail!("modbus.port must be between 1 and 65535");
        }
        if self.modbus.request_timeout().is_zero() {
            bail!("modbus.request_timeout_ms must be greater than 0");
        }

        if self.mqtt.enabled {
            self.mqtt.broker_addr()?;
            if self.mqtt.topic.is_empty() {
                bail!("mqtt.topic cannot be empty");
            }
            if self.mqtt.qos() > 2 {
                bail!("mqtt.qos must be 0, 1 or 2");
            }
        }

        if self.broadcast.enabled && self.broadcast.self_ip.is_none() {
            bail!("broadcast.self_ip is required when broadcast is enabled");
        }

        if self.interval_secs == Some(0) {
            bail!("interval_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(30))
    }

    pub fn log_query(&self) -> bool {
        self.log_query == Some(true)
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    fn default_modbus_port() -> u16 {
        502
    }

    fn default_mqtt() -> Mqtt {
        Mqtt {
            enabled: false,
            broker: Self::default_mqtt_broker(),
            topic: String::new(),
            client_id: Self::default_mqtt_client_id(),
            username: None,
            password: None,
            qos: None,
            retain: None,
        }
    }

    fn default_mqtt_broker() -> String {
        "tcp://localhost:1883".to_string()
    }

    fn default_mqtt_client_id() -> String {
        "huawei-solar-bridge".to_string()
    }

    fn default_broadcast() -> Broadcast {
        Broadcast {
            enabled: false,
            destination_ip: None,
            self_ip: None,
        }
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> Result<Config> {
        let mut file = NamedTempFile::new()?;
        file.write_all(yaml.as_bytes())?;
        Config::new(file.path().to_string_lossy().into_owned())
    }

    #[test]
    fn full_config() -> Result<()> {
        let config = load(
            r#"
modbus:
  host: 192.168.1.50
  port: 6607
  slave_id: 0
  username: installer
  password: "00000a"
  login_delay_ms: 250
mqtt:
  broker: tcp://broker.local:1884
  topic: solar/inverter
  qos: 1
  retain: true
broadcast:
  destination_ip: 192.168.1.255
  self_ip: 192.168.1.20
interval_secs: 10
log_query: true
"#,
        )?;

        assert_eq!(config.modbus.host(), "192.168.1.50");
        assert_eq!(config.modbus.port(), 6607);
        assert_eq!(config.modbus.slave_id(), 0);
        assert_eq!(config.modbus.login_delay(), Duration::from_millis(250));
        assert_eq!(config.modbus.login_timeout(), Duration::from_secs(15));
        assert!(config.mqtt.enabled());
        assert_eq!(config.mqtt.broker_addr()?, ("broker.local".to_string(), 1884));
        assert_eq!(config.mqtt.client_id(), "huawei-solar-bridge");
        assert_eq!(config.mqtt.qos(), 1);
        assert!(config.mqtt.retain());
        assert_eq!(config.broadcast.destination_ip(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(config.broadcast.self_ip(), Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert!(config.log_query());
        assert_eq!(config.loglevel(), "info");

        Ok(())
    }

    #[test]
    fn defaults() -> Result<()> {
        let config = load("modbus:\n  ip: 10.0.0.2\n")?;

        assert_eq!(config.modbus.host(), "10.0.0.2");
        assert_eq!(config.modbus.port(), 502);
        assert_eq!(config.modbus.slave_id(), 1);
        assert_eq!(config.modbus.request_timeout(), Duration::from_secs(5));
        assert!(config.modbus.use_tcp_nodelay());
        assert!(!config.modbus.query_device_info());
        assert!(!config.mqtt.enabled());
        assert!(!config.broadcast.enabled());
        assert_eq!(config.broadcast.destination_ip(), Ipv4Addr::BROADCAST);
        assert_eq!(config.interval(), Duration::from_secs(30));

        Ok(())
    }

    #[test]
    fn reports_missing_sections() -> Result<()> {
        let document: serde_yaml::Value = serde_yaml::from_str("modbus:\n  host: h\n")?;
        assert_eq!(Config::missing_sections(&document), vec!["mqtt", "broadcast"]);

        let document: serde_yaml::Value =
            serde_yaml::from_str("modbus:\n  host: h\nmqtt:\n  topic: t\n")?;
        assert_eq!(Config::missing_sections(&document), vec!["broadcast"]);

        let config = load("modbus:\n  host: h\nmqtt:\n  topic: t\n")?;
        assert!(config.mqtt.enabled());
        assert!(!config.broadcast.enabled());

        Ok(())
    }

    #[test]
    fn broadcast_requires_self_ip() {
        let err = load("modbus:\n  host: 10.0.0.2\nbroadcast:\n  enabled: true\n").unwrap_err();

        assert!(err.to_string().contains("self_ip"));
    }

    #[test]
    fn mqtt_requires_topic() {
        let err = load("modbus:\n  host: 10.0.0.2\nmqtt:\n  broker: localhost:1883\n").unwrap_err();

        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn rejects_bad_qos_and_interval() {
        assert!(load("modbus:\n  host: h\nmqtt:\n  topic: t\n  qos: 3\n").is_err());
        assert!(load("modbus:\n  host: h\ninterval_secs: 0\n").is_err());
    }

    #[test]
    fn rejects_invalid_self_ip() {
        assert!(load("modbus:\n  host: h\nbroadcast:\n  self_ip: not-an-ip\n").is_err());
    }

    #[test]
    fn missing_file() {
        assert!(Config::new("/nonexistent/config.yaml".to_string()).is_err());
    }
}
