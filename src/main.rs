use kube_podcap::{cli::Cli, config::Config, errors::AppResult};

#[tokio::main]
async fn main() -> AppResult<()> {
    kube_podcap::logging::init();

    let cli = <Cli as clap::Parser>::parse();
    let config = Config::try_from(cli)?;

    kube_podcap::run(config).await
}
