use glreg::config::Opts;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = match Opts::from_args_safe() {
        Ok(opts) => opts,
        Err(e) if e.use_stderr() => {
            eprintln!("{}", e.message);
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    init_logging(opts.verbose);
    glreg::run(opts).await
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "glreg=info,registry_client=info",
        1 => "glreg=debug,registry_client=debug",
        _ => "glreg=trace,registry_client=trace,reqwest=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
