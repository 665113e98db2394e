pub mod accumulator;
pub mod fetcher;

pub use accumulator::BarAccumulator;
pub use fetcher::MarketDataFetcher;
