use anyhow::Result;

fn main() -> Result<()> {
    kvload_cli::cli::execute()
}
