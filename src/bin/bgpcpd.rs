fn main() -> anyhow::Result<()> {
    bgpcp_cmd::cmd::run()?;
    Ok(())
}
