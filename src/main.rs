fn main() -> anyhow::Result<()> {
    zero_dash_lib::run()
}
