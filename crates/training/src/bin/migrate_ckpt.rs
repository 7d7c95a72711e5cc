use clap::Parser;
use training::run::{run_migrate, MigrateArgs};

fn main() -> anyhow::Result<()> {
    let args = MigrateArgs::parse();
    run_migrate(args)
}
