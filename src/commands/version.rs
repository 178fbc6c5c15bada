pub fn run() -> anyhow::Result<()> {
    println!("node-mechanic {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
