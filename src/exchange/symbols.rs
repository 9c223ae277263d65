//! Per-venue symbol, interval and precision formatting

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{canonical_symbol, Interval, Venue};

const QUOTES: [&str; 5] = ["USDT", "USDC", "BUSD", "KRW", "USD"];

/// Split a symbol in any venue spelling into (base, quote).
///
/// Quote defaults to the venue's quote currency when the symbol is a bare coin.
pub fn split_base_quote(venue: Venue, raw: &str) -> (String, String) {
    let sym = canonical_symbol(raw);

    // KRW-BTC spelling puts the quote first
    if raw.trim().to_uppercase().starts_with("KRW-") || (sym.starts_with("KRW") && sym.len() > 3 && venue.is_spot() && !sym.ends_with("KRW")) {
        return (sym[3..].to_string(), "KRW".to_string());
    }

    for quote in QUOTES {
        if sym.len() > quote.len() && sym.ends_with(quote) {
            return (sym[..sym.len() - quote.len()].to_string(), quote.to_string());
        }
    }
    (sym, venue.quote_currency().to_string())
}

/// Venue-native instrument name for REST and stream calls.
pub fn venue_symbol(venue: Venue, raw: &str) -> String {
    let (base, quote) = split_base_quote(venue, raw);
    match venue {
        Venue::Bybit | Venue::Binance | Venue::Bitget => format!("{base}{quote}"),
        Venue::Okx => format!("{base}-{quote}-SWAP"),
        Venue::Bingx => format!("{base}-{quote}"),
        Venue::Upbit => format!("{quote}-{base}"),
        Venue::Bithumb => format!("{base}_{quote}"),
        Venue::Lighter => base,
        Venue::Generic => unified_symbol(&base, &quote, false),
    }
}

/// CCXT-style unified symbol: `BTC/USDT:USDT` for swaps, `BTC/KRW` for spot.
pub fn unified_symbol(base: &str, quote: &str, spot: bool) -> String {
    if spot {
        format!("{base}/{quote}")
    } else {
        format!("{base}/{quote}:{quote}")
    }
}

/// REST kline interval code.
pub fn interval_code(venue: Venue, interval: Interval) -> &'static str {
    use Interval::*;
    match venue {
        Venue::Bybit => match interval {
            Min1 => "1",
            Min3 => "3",
            Min5 => "5",
            Min15 => "15",
            Min30 => "30",
            Hour1 => "60",
            Hour4 => "240",
            Day1 => "D",
        },
        Venue::Okx | Venue::Bitget => match interval {
            Hour1 => "1H",
            Hour4 => "4H",
            Day1 => "1D",
            other => other.as_str(),
        },
        // Upbit candles are addressed by path: minutes/{n} or days
        Venue::Upbit => match interval {
            Min1 => "minutes/1",
            Min3 => "minutes/3",
            Min5 => "minutes/5",
            Min15 => "minutes/15",
            Min30 => "minutes/30",
            Hour1 => "minutes/60",
            Hour4 => "minutes/240",
            Day1 => "days",
        },
        Venue::Bithumb => match interval {
            Day1 => "24h",
            other => other.as_str(),
        },
        Venue::Binance | Venue::Bingx | Venue::Lighter | Venue::Generic => interval.as_str(),
    }
}

/// Lighter perp market index for a base asset.
pub fn lighter_market_id(base: &str) -> Option<u32> {
    match base.to_uppercase().as_str() {
        "ETH" => Some(0),
        "BTC" => Some(1),
        "SOL" => Some(2),
        _ => None,
    }
}

/// Decimal places a venue accepts for quantity and price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    pub qty_decimals: u32,
    pub price_decimals: u32,
}

impl Precision {
    pub fn for_venue(venue: Venue) -> Self {
        match venue {
            Venue::Bybit => Self { qty_decimals: 3, price_decimals: 1 },
            Venue::Upbit | Venue::Bithumb => Self { qty_decimals: 8, price_decimals: 0 },
            Venue::Lighter => Self { qty_decimals: 4, price_decimals: 2 },
            _ => Self { qty_decimals: 3, price_decimals: 2 },
        }
    }

    /// Quantity rounded toward zero so an order never exceeds what was sized.
    pub fn format_qty(&self, qty: f64) -> String {
        round_str(qty, self.qty_decimals, RoundingStrategy::ToZero)
    }

    pub fn format_price(&self, price: f64) -> String {
        round_str(price, self.price_decimals, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn round_qty(&self, qty: f64) -> f64 {
        round_f64(qty, self.qty_decimals, RoundingStrategy::ToZero)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_f64(price, self.price_decimals, RoundingStrategy::MidpointAwayFromZero)
    }
}

fn round_decimal(value: f64, dp: u32, strategy: RoundingStrategy) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp_with_strategy(dp, strategy).normalize())
}

fn round_str(value: f64, dp: u32, strategy: RoundingStrategy) -> String {
    round_decimal(value, dp, strategy)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "0".to_string())
}

fn round_f64(value: f64, dp: u32, strategy: RoundingStrategy) -> f64 {
    round_decimal(value, dp, strategy)
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_formats() {
        assert_eq!(venue_symbol(Venue::Bybit, "BTC/USDT"), "BTCUSDT");
        assert_eq!(venue_symbol(Venue::Okx, "BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(venue_symbol(Venue::Bingx, "BTCUSDT"), "BTC-USDT");
        assert_eq!(venue_symbol(Venue::Upbit, "BTC"), "KRW-BTC");
        assert_eq!(venue_symbol(Venue::Upbit, "KRW-BTC"), "KRW-BTC");
        assert_eq!(venue_symbol(Venue::Bithumb, "KRW-ETH"), "ETH_KRW");
        assert_eq!(venue_symbol(Venue::Bithumb, "BTC_KRW"), "BTC_KRW");
        assert_eq!(venue_symbol(Venue::Generic, "BTCUSDT"), "BTC/USDT:USDT");
        assert_eq!(venue_symbol(Venue::Lighter, "ETHUSDT"), "ETH");
    }

    #[test]
    fn interval_codes_per_venue() {
        assert_eq!(interval_code(Venue::Bybit, Interval::Hour1), "60");
        assert_eq!(interval_code(Venue::Bybit, Interval::Day1), "D");
        assert_eq!(interval_code(Venue::Okx, Interval::Hour4), "4H");
        assert_eq!(interval_code(Venue::Binance, Interval::Min15), "15m");
        assert_eq!(interval_code(Venue::Upbit, Interval::Min15), "minutes/15");
        assert_eq!(interval_code(Venue::Bithumb, Interval::Day1), "24h");
    }

    #[test]
    fn qty_rounds_toward_zero() {
        let p = Precision::for_venue(Venue::Bybit);
        assert_eq!(p.format_qty(0.0129), "0.012");
        assert_eq!(p.format_price(49_000.06), "49000.1");
        assert!((p.round_qty(1.23456) - 1.234).abs() < 1e-12);
    }

    #[test]
    fn lighter_markets() {
        assert_eq!(lighter_market_id("btc"), Some(1));
        assert_eq!(lighter_market_id("DOGE"), None);
    }
}
