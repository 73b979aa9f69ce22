//! Standard indicator set, computed with the `ta` crate
//!
//! Snapshot providers call [`enrich`] so that every bar carries the inputs the
//! technical analyzer and the regime classifier look for. Values supplied by
//! the data source are never overwritten; warmup bars get no entry at all,
//! which analyzers treat as unavailable.
//!
//! | Name | Definition |
//! |---|---|
//! | `rsi` | RSI(14) |
//! | `macd`, `macd_signal`, `macd_hist` | MACD(12, 26, 9) |
//! | `bb_upper`, `bb_middle`, `bb_lower`, `bb_position` | Bollinger(20, 2) |
//! | `sma_20`, `sma_50`, `sma_200` | simple moving averages |
//! | `atr` | ATR(14), Wilder smoothing |
//! | `adx` | ADX(14), Wilder smoothing |

use ta::indicators::{
    BollingerBands, MovingAverageConvergenceDivergence, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::Next;

use crate::MarketSnapshot;

pub const RSI_PERIOD: usize = 14;
pub const MACD_PERIODS: (usize, usize, usize) = (12, 26, 9);
pub const BB_PERIOD: usize = 20;
pub const BB_STD: f64 = 2.0;
pub const SMA_PERIODS: [usize; 3] = [20, 50, 200];
pub const ATR_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;

/// Feed `values` through a `ta` indicator, hiding the first `warmup - 1` outputs
fn run<I, O>(indicator: &mut I, values: &[f64], warmup: usize, mut project: impl FnMut(I::Output) -> O) -> Vec<Option<O>>
where
    I: Next<f64>,
{
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let out = project(indicator.next(v));
            (i + 1 >= warmup).then_some(out)
        })
        .collect()
}

pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    match SimpleMovingAverage::new(period) {
        Ok(mut ind) => run(&mut ind, values, period, |v| v),
        Err(_) => vec![None; values.len()],
    }
}

pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    match RelativeStrengthIndex::new(period) {
        Ok(mut ind) => run(&mut ind, values, period, |v| v),
        Err(_) => vec![None; values.len()],
    }
}

/// (macd, signal, histogram), valid once the slow EMA has warmed up
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<Option<(f64, f64, f64)>> {
    match MovingAverageConvergenceDivergence::new(fast, slow, signal) {
        Ok(mut ind) => run(&mut ind, values, slow, |o| (o.macd, o.signal, o.histogram)),
        Err(_) => vec![None; values.len()],
    }
}

/// (upper, middle, lower)
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> Vec<Option<(f64, f64, f64)>> {
    match BollingerBands::new(period, num_std) {
        Ok(mut ind) => run(&mut ind, values, period, |o| (o.upper, o.average, o.lower)),
        Err(_) => vec![None; values.len()],
    }
}

pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..high.len())
        .map(|i| {
            let range = high[i] - low[i];
            if i == 0 {
                range
            } else {
                range
                    .max((high[i] - close[i - 1]).abs())
                    .max((low[i] - close[i - 1]).abs())
            }
        })
        .collect()
}

/// Wilder smoothing seeded with the simple mean of the first `period` values
fn wilder(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(current);
    for i in period..values.len() {
        current = (current * (period - 1) as f64 + values[i]) / period as f64;
        out[i] = Some(current);
    }
    out
}

pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.len() != low.len() || high.len() != close.len() {
        return vec![None; close.len()];
    }
    wilder(&true_range(high, low, close), period)
}

/// Average directional index; first value after `2 * period - 1` bars.
///
/// Directional movement and true range are smoothed from bar 1 onwards, since
/// bar 0 has no previous bar to move from.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = close.len();
    if period == 0 || n < 2 || high.len() != n || low.len() != n {
        return vec![None; n];
    }

    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    // Index k of these series is bar k + 1
    let plus = wilder(&plus_dm[1..], period);
    let minus = wilder(&minus_dm[1..], period);
    let range = wilder(&true_range(high, low, close)[1..], period);

    // DX from the first bar where the directional indicators exist
    let start = period;
    let dx: Vec<f64> = (start..n)
        .map(|i| match (plus[i - 1], minus[i - 1], range[i - 1]) {
            (Some(p), Some(m), Some(tr)) if tr > 0.0 => {
                let (pdi, mdi) = (p / tr * 100.0, m / tr * 100.0);
                if pdi + mdi > 0.0 {
                    (pdi - mdi).abs() / (pdi + mdi) * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        })
        .collect();

    let mut out = vec![None; n];
    for (j, value) in wilder(&dx, period).into_iter().enumerate() {
        out[start + j] = value;
    }
    out
}

/// Add the standard indicator set to a symbol's snapshots (oldest first)
/// without overwriting values already present.
pub fn enrich(snapshots: &mut [MarketSnapshot]) {
    if snapshots.is_empty() {
        return;
    }
    let close: Vec<f64> = snapshots.iter().map(|s| s.close).collect();
    let high: Vec<f64> = snapshots.iter().map(|s| s.high).collect();
    let low: Vec<f64> = snapshots.iter().map(|s| s.low).collect();

    let mut series: Vec<(String, Vec<Option<f64>>)> = vec![
        ("rsi".to_string(), rsi(&close, RSI_PERIOD)),
        ("atr".to_string(), atr(&high, &low, &close, ATR_PERIOD)),
        ("adx".to_string(), adx(&high, &low, &close, ADX_PERIOD)),
    ];
    for period in SMA_PERIODS {
        series.push((format!("sma_{}", period), sma(&close, period)));
    }

    let (fast, slow, signal) = MACD_PERIODS;
    let macd_out = macd(&close, fast, slow, signal);
    series.push(("macd".to_string(), macd_out.iter().map(|o| o.map(|v| v.0)).collect()));
    series.push(("macd_signal".to_string(), macd_out.iter().map(|o| o.map(|v| v.1)).collect()));
    series.push(("macd_hist".to_string(), macd_out.iter().map(|o| o.map(|v| v.2)).collect()));

    let bands = bollinger_bands(&close, BB_PERIOD, BB_STD);
    series.push(("bb_upper".to_string(), bands.iter().map(|o| o.map(|b| b.0)).collect()));
    series.push(("bb_middle".to_string(), bands.iter().map(|o| o.map(|b| b.1)).collect()));
    series.push(("bb_lower".to_string(), bands.iter().map(|o| o.map(|b| b.2)).collect()));
    let position: Vec<Option<f64>> = bands
        .iter()
        .zip(&close)
        .map(|(band, &c)| {
            band.and_then(|(upper, _, lower)| {
                let width = upper - lower;
                (width > 0.0).then(|| (c - lower) / width)
            })
        })
        .collect();
    series.push(("bb_position".to_string(), position));

    for (name, values) in series {
        for (snap, value) in snapshots.iter_mut().zip(values) {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                snap.indicators.entry(name.clone()).or_insert(v);
            }
        }
    }
}
