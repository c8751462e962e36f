use std::env;
use std::path::Path;
use std::process;

use log::error;

use alphacraft::config::{LaunchOptions, ServerConfig};
use alphacraft::server::Server;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let options = match LaunchOptions::parse(env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("usage: alphacraft [-record <file>] [-replay <file>] <world>");
            process::exit(1);
        }
    };

    let config = match ServerConfig::load_or_default(Path::new("server.toml")) {
        Ok(config) => config,
        Err(e) => {
            error!("server.toml: {}", e);
            process::exit(1);
        }
    };

    let server = match Server::bind(&config, options).await {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("serve: {}", e);
        process::exit(1);
    }
}
