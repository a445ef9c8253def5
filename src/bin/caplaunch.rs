use anyhow::Result;

fn main() -> Result<()> {
    capbox::cli::run()
}
