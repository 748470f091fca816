mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use server::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "node", version, about = "面板节点代理 - 从面板同步协议、用户并上报流量")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 前台运行节点服务
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// 配置文件变更时自动重载
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        watch: bool,
    },

    /// 显示版本信息
    Version,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Command::Server { config, watch } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::run_server(config, watch))?;
        }

        Command::Version => {
            println!("node v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
