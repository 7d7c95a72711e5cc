use clap::Parser;
use training::run::{run_build_model, BuildModelArgs};

fn main() -> anyhow::Result<()> {
    let args = BuildModelArgs::parse();
    run_build_model(args)
}
