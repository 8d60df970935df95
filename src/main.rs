use log::error;

#[tokio::main]
async fn main() {
    if let Err(e) = huawei_solar_bridge::app().await {
        error!("{:?}", e);
        std::process::exit(255);
    }
}
