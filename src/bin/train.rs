use anyhow::Result;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    crop_price_forecast::cli::run_train(&args)
}
