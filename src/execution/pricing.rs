//! KRX price-tick arithmetic.

/// Minimum price increment for a KRX quote at `price` (2023 schedule).
pub fn tick_size(price: i64) -> i64 {
    match price {
        p if p < 2_000 => 1,
        p if p < 5_000 => 5,
        p if p < 20_000 => 10,
        p if p < 50_000 => 50,
        p if p < 200_000 => 100,
        p if p < 500_000 => 500,
        _ => 1_000,
    }
}

/// Greatest tick-aligned price strictly below `target`.
///
/// Used to price take-profit limit sells one tick under the target so the
/// order is marketable once the target trades.
pub fn limit_sell_price(target: i64) -> i64 {
    let tick = tick_size(target);
    let aligned = (target / tick) * tick;
    if aligned == target {
        target - tick
    } else {
        aligned
    }
}

/// Price at which `rate` is realized on `entry_price`, truncated to a won.
pub fn target_price(entry_price: i64, rate: f64) -> i64 {
    (entry_price as f64 * (1.0 + rate)) as i64
}
