use anyhow::Result;

fn main() -> Result<()> {
    sandcell::cli::run()
}
