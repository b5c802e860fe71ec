//! Launcher that also serves the `demo` module. Used by the end-to-end tests.

use capsule::launcher::{self, demo, LauncherArgs, ModuleRegistry};
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = LauncherArgs::parse();
    launcher::init_logging(&args);

    let registry = ModuleRegistry::new().with(demo::demo_module());
    std::process::exit(launcher::run(args, registry).await);
}
