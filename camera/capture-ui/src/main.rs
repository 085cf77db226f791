use clap::Parser;
use eyre::Result;
use tracing::info;

use capture_ui::{CaptureTarget, HighguiSurface, OpencvCapture, run_viewer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Camera index, or a device path, file or stream URL
    #[arg(default_value = "0")]
    url: CaptureTarget,
}

fn main() -> Result<()> {
    let _guard = env_tracing_logger::init()?;
    let cli = Cli::parse();

    info!("OpenCV {}", opencv::core::CV_VERSION);
    info!("URL: {}", cli.url);

    let source = OpencvCapture::open(&cli.url)?;
    run_viewer(source, |_size| HighguiSurface::new(env!("CARGO_PKG_NAME")))?;
    Ok(())
}
