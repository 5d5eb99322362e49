use sessionproxy::client::main::run_proxy;

#[tokio::main]
async fn main() {
    run_proxy().await;
}
