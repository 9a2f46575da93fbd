fn main() -> anyhow::Result<()> {
    dnsgate::cli::run()
}
