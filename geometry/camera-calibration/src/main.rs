use clap::Parser;
use eyre::Result;

use camera_calibration::{Cli, run_cal};

fn main() -> Result<()> {
    let _guard = env_tracing_logger::init()?;
    let cli = Cli::parse();
    run_cal(cli, &opencv_calibrate::OpencvBackend::new())
}
