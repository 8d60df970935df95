use clap::Parser;

/// Huawei Solar Bridge - polls a Huawei inverter over Modbus TCP and publishes to MQTT
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Query a single record, print it as JSON and exit
    #[clap(long = "once")]
    pub once: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
