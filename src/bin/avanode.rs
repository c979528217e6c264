#[tokio::main]
async fn main() {
    let code = avanode_cli::run().await;
    std::process::exit(code);
}
