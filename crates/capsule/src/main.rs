//! `capsule-launcher`: the process started inside each environment.

use capsule::launcher::{self, LauncherArgs, ModuleRegistry};
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = LauncherArgs::parse();
    launcher::init_logging(&args);

    let code = launcher::run(args, ModuleRegistry::new()).await;
    // Exit without waiting for the runtime: a blocked stdin read would hold
    // its shutdown open.
    std::process::exit(code);
}
