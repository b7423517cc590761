//! Time-of-day session boost.
//!
//! Symbols historically active in a regional session score higher while
//! that session is live. Affinity tables come from configuration; nothing
//! is hard-coded in the algorithm.

use crate::config::SessionConfig;
use rust_decimal::Decimal;
use std::collections::HashSet;

const QUOTE_SUFFIXES: [&str; 4] = ["USDT", "FDUSD", "USDC", "BUSD"];

/// Session windows in UTC hours, half-open.
const ASIA_HOURS: (u32, u32) = (0, 8);
const EUROPE_HOURS: (u32, u32) = (7, 16);
const US_HOURS: (u32, u32) = (13, 22);

/// Data-driven affinity tables with their multipliers.
pub struct SessionTable {
    asia: HashSet<String>,
    europe: HashSet<String>,
    us: HashSet<String>,
    asia_mult: Decimal,
    europe_mult: Decimal,
    us_mult: Decimal,
}

impl SessionTable {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            asia: config.asia.iter().cloned().collect(),
            europe: config.europe.iter().cloned().collect(),
            us: config.us.iter().cloned().collect(),
            asia_mult: config.asia_mult,
            europe_mult: config.europe_mult,
            us_mult: config.us_mult,
        }
    }

    /// Boost multiplier for a symbol at the given UTC hour. Overlapping
    /// windows resolve to the highest applicable multiplier; 1.0 otherwise.
    pub fn multiplier(&self, symbol: &str, hour_utc: u32) -> Decimal {
        let base = base_asset(symbol);
        let mut best = Decimal::ONE;

        if in_window(hour_utc, ASIA_HOURS) && self.asia.contains(base) {
            best = best.max(self.asia_mult);
        }
        if in_window(hour_utc, EUROPE_HOURS) && self.europe.contains(base) {
            best = best.max(self.europe_mult);
        }
        if in_window(hour_utc, US_HOURS) && self.us.contains(base) {
            best = best.max(self.us_mult);
        }
        best
    }
}

fn in_window(hour: u32, (start, end): (u32, u32)) -> bool {
    hour >= start && hour < end
}

/// Strip a known quote suffix to get the base asset.
pub fn base_asset(symbol: &str) -> &str {
    for quote in QUOTE_SUFFIXES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use rust_decimal_macros::dec;

    fn table() -> SessionTable {
        SessionTable::from_config(&SessionConfig::default())
    }

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("SOLFDUSD"), "SOL");
        assert_eq!(base_asset("WEIRD"), "WEIRD");
    }

    #[test]
    fn test_asia_symbol_in_asia_hours() {
        assert_eq!(table().multiplier("BNBUSDT", 3), dec!(2.0));
    }

    #[test]
    fn test_asia_symbol_outside_asia_hours() {
        assert_eq!(table().multiplier("BNBUSDT", 12), dec!(1.0));
    }

    #[test]
    fn test_europe_symbol_in_europe_hours() {
        assert_eq!(table().multiplier("BTCUSDT", 9), dec!(1.8));
    }

    #[test]
    fn test_us_symbol_in_us_hours() {
        assert_eq!(table().multiplier("SOLUSDT", 20), dec!(2.0));
    }

    #[test]
    fn test_overlap_takes_highest() {
        // 13:00-16:00 UTC is both Europe and US. A symbol listed in both
        // tables gets the larger multiplier.
        let config = SessionConfig {
            europe: vec!["XYZ".to_string()],
            us: vec!["XYZ".to_string()],
            ..SessionConfig::default()
        };
        let table = SessionTable::from_config(&config);
        assert_eq!(table.multiplier("XYZUSDT", 14), dec!(2.0));
    }

    #[test]
    fn test_unlisted_symbol_neutral() {
        assert_eq!(table().multiplier("PEPEUSDT", 3), dec!(1.0));
    }
}
