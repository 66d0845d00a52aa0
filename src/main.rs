fn main() -> anyhow::Result<()> {
    smol::block_on(segproxy::run())
}
