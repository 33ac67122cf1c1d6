//! Indicator engine.
//!
//! Spec §9 models "dynamic/duck typing of indicators" as a tagged sum plus
//! a common behavioural interface. `IndicatorKind` is the tagged sum, the
//! `Indicator` trait is the behavioural interface (`warmup_bars`,
//! `required_interval`, `update`), and `IndicatorRegistry` is the
//! string→constructor map. Stateful indicators (EMA, VWAP, OBV, MACD,
//! Bollinger) carry state across calls; stateless ones (SMA, WMA,
//! High/Low) recompute from the bar-sequence suffix every call.

use crate::bar::Bar;
use crate::interval::Interval;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Indicator key format: `<name>_<period>_<interval>`, period omitted for
/// zero-period indicators (`vwap_1m`).
pub fn indicator_key(name: &str, period: Option<u32>, interval: Interval) -> String {
    match period {
        Some(p) => format!("{name}_{p}_{interval}"),
        None => format!("{name}_{interval}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub name: String,
    pub period: Option<u32>,
    pub interval: Interval,
    pub params: std::collections::BTreeMap<String, f64>,
}

/// The value an indicator emits. Multi-output indicators (MACD, Bollinger,
/// swing high/low) carry named fields rather than forcing a single scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IndicatorValue {
    Scalar(f64),
    Macd { macd: f64, signal: f64, histogram: f64 },
    Bollinger { upper: f64, middle: f64, lower: f64 },
    HighLow { high: f64, low: f64 },
}

impl IndicatorValue {
    pub fn scalar(self) -> Option<f64> {
        match self {
            IndicatorValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

/// `IndicatorData` as stored in `SessionData`: config, internal state,
/// the last emitted value, and validity. `valid` starts false and never
/// becomes true before `warmup_bars()` observations have been seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorData {
    pub config: IndicatorConfig,
    pub state: IndicatorState,
    pub current_value: Option<IndicatorValue>,
    pub last_updated: Option<i64>,
    pub valid: bool,
}

/// Internal indicator state, serialized so a snapshot can show it but
/// otherwise opaque to callers — only the owning `Indicator` impl
/// interprets the fields meaningfully.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorState {
    pub ema: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub macd_signal_ema: Option<f64>,
    pub cumulative_pv: f64,
    pub cumulative_volume: f64,
    pub obv: f64,
    pub observed: u32,
}

/// Behavioural contract every indicator kind implements.
pub trait Indicator: Send {
    fn warmup_bars(&self) -> u32;
    fn required_interval(&self) -> Interval;
    /// Compute the next value from the full bar sequence (or the last N
    /// via the deque) and the indicator's previous state. Returns `None`
    /// while still in warmup.
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue>;
}

fn closes(bars: &VecDeque<Bar>, n: usize) -> Vec<f64> {
    bars.iter().rev().take(n).map(|b| b.close).collect::<Vec<_>>().into_iter().rev().collect()
}

pub struct Sma {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Sma {
    fn warmup_bars(&self) -> u32 {
        self.period
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        if bars.len() < self.period as usize {
            return None;
        }
        let window = closes(bars, self.period as usize);
        let sum: f64 = window.iter().sum();
        Some(IndicatorValue::Scalar(sum / self.period as f64))
    }
}

pub struct Wma {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Wma {
    fn warmup_bars(&self) -> u32 {
        self.period
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        if bars.len() < self.period as usize {
            return None;
        }
        let window = closes(bars, self.period as usize);
        let denom = (self.period * (self.period + 1) / 2) as f64;
        let weighted: f64 = window.iter().enumerate().map(|(i, v)| v * (i as f64 + 1.0)).sum();
        Some(IndicatorValue::Scalar(weighted / denom))
    }
}

fn ema_step(prev: Option<f64>, price: f64, period: u32) -> f64 {
    let k = 2.0 / (period as f64 + 1.0);
    match prev {
        Some(p) => price * k + p * (1.0 - k),
        None => price,
    }
}

pub struct Ema {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Ema {
    fn warmup_bars(&self) -> u32 {
        self.period
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let bar = bars.back()?;
        state.observed += 1;
        let new_ema = ema_step(state.ema, bar.close, self.period);
        state.ema = Some(new_ema);
        if state.observed < self.period {
            return None;
        }
        Some(IndicatorValue::Scalar(new_ema))
    }
}

/// DEMA(N) = 2*EMA(N) - EMA(EMA(N)); warmup is 2N per spec §4.2.
pub struct Dema {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Dema {
    fn warmup_bars(&self) -> u32 {
        self.period * 2
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let bar = bars.back()?;
        state.observed += 1;
        let ema1 = ema_step(state.ema, bar.close, self.period);
        state.ema = Some(ema1);
        let ema2 = ema_step(state.ema_fast, ema1, self.period);
        state.ema_fast = Some(ema2);
        if state.observed < self.warmup_bars() {
            return None;
        }
        Some(IndicatorValue::Scalar(2.0 * ema1 - ema2))
    }
}

/// TEMA(N) = 3*EMA1 - 3*EMA2 + EMA3; warmup is 3N per spec §4.2.
pub struct Tema {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Tema {
    fn warmup_bars(&self) -> u32 {
        self.period * 3
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let bar = bars.back()?;
        state.observed += 1;
        let ema1 = ema_step(state.ema, bar.close, self.period);
        state.ema = Some(ema1);
        let ema2 = ema_step(state.ema_fast, ema1, self.period);
        state.ema_fast = Some(ema2);
        let ema3 = ema_step(state.ema_slow, ema2, self.period);
        state.ema_slow = Some(ema3);
        if state.observed < self.warmup_bars() {
            return None;
        }
        Some(IndicatorValue::Scalar(3.0 * ema1 - 3.0 * ema2 + ema3))
    }
}

/// RSI(N); warmup N+1 per spec §4.2 (needs N deltas, hence N+1 closes).
pub struct Rsi {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for Rsi {
    fn warmup_bars(&self) -> u32 {
        self.period + 1
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let need = self.warmup_bars() as usize;
        if bars.len() < need {
            return None;
        }
        let window = closes(bars, need);
        let mut gains = 0.0;
        let mut losses = 0.0;
        for pair in window.windows(2) {
            let delta = pair[1] - pair[0];
            if delta >= 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        let n = self.period as f64;
        let avg_gain = gains / n;
        let avg_loss = losses / n;
        if avg_loss == 0.0 {
            return Some(IndicatorValue::Scalar(100.0));
        }
        let rs = avg_gain / avg_loss;
        Some(IndicatorValue::Scalar(100.0 - (100.0 / (1.0 + rs))))
    }
}

/// MACD(12,26,9); warmup 26 per spec §4.2 table (the slow EMA dominates).
pub struct Macd {
    pub fast: u32,
    pub slow: u32,
    pub signal: u32,
    pub interval: Interval,
}
impl Indicator for Macd {
    fn warmup_bars(&self) -> u32 {
        self.slow
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let bar = bars.back()?;
        state.observed += 1;
        let fast = ema_step(state.ema_fast, bar.close, self.fast);
        let slow = ema_step(state.ema_slow, bar.close, self.slow);
        state.ema_fast = Some(fast);
        state.ema_slow = Some(slow);
        let macd_line = fast - slow;
        let signal_line = ema_step(state.macd_signal_ema, macd_line, self.signal);
        state.macd_signal_ema = Some(signal_line);
        if state.observed < self.warmup_bars() {
            return None;
        }
        Some(IndicatorValue::Macd {
            macd: macd_line,
            signal: signal_line,
            histogram: macd_line - signal_line,
        })
    }
}

/// Bollinger Bands: SMA(N) +/- k * stddev(N).
pub struct Bollinger {
    pub period: u32,
    pub k: f64,
    pub interval: Interval,
}
impl Indicator for Bollinger {
    fn warmup_bars(&self) -> u32 {
        self.period
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        if bars.len() < self.period as usize {
            return None;
        }
        let window = closes(bars, self.period as usize);
        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        Some(IndicatorValue::Bollinger {
            upper: mean + self.k * std_dev,
            middle: mean,
            lower: mean - self.k * std_dev,
        })
    }
}

/// VWAP: cumulative over the session, resets each roll via `IndicatorState`
/// being re-initialized at session start. Warmup is 1 (spec §4.2).
pub struct Vwap {
    pub interval: Interval,
}
impl Indicator for Vwap {
    fn warmup_bars(&self) -> u32 {
        1
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let bar = bars.back()?;
        let typical_price = (bar.high + bar.low + bar.close) / 3.0;
        state.cumulative_pv += typical_price * bar.volume as f64;
        state.cumulative_volume += bar.volume as f64;
        if state.cumulative_volume == 0.0 {
            return None;
        }
        Some(IndicatorValue::Scalar(state.cumulative_pv / state.cumulative_volume))
    }
}

/// On-Balance Volume. Warmup is effectively 1 bar (no table entry; OBV is
/// a running total, valid from the first bar).
pub struct Obv {
    pub interval: Interval,
}
impl Indicator for Obv {
    fn warmup_bars(&self) -> u32 {
        1
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        if bars.len() < 2 {
            return None;
        }
        let mut it = bars.iter().rev();
        let last = it.next().unwrap();
        let prev = it.next().unwrap();
        if last.close > prev.close {
            state.obv += last.volume as f64;
        } else if last.close < prev.close {
            state.obv -= last.volume as f64;
        }
        Some(IndicatorValue::Scalar(state.obv))
    }
}

/// Stochastic oscillator %K smoothed by `smooth`; warmup N+smooth per
/// spec §4.2.
pub struct Stochastic {
    pub period: u32,
    pub smooth: u32,
    pub interval: Interval,
}
impl Indicator for Stochastic {
    fn warmup_bars(&self) -> u32 {
        self.period + self.smooth
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let need = self.warmup_bars() as usize;
        if bars.len() < need {
            return None;
        }
        let raw_k: Vec<f64> = (0..self.smooth)
            .map(|back_offset| {
                let window: Vec<&Bar> = bars
                    .iter()
                    .rev()
                    .skip(back_offset as usize)
                    .take(self.period as usize)
                    .collect();
                let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                let close = window[0].close;
                if (high - low).abs() < f64::EPSILON {
                    50.0
                } else {
                    (close - low) / (high - low) * 100.0
                }
            })
            .collect();
        let smoothed = raw_k.iter().sum::<f64>() / raw_k.len() as f64;
        Some(IndicatorValue::Scalar(smoothed))
    }
}

/// Swing high/low over a centered 2N+1 window; warmup 2N+1 per spec §4.2.
pub struct SwingHighLow {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for SwingHighLow {
    fn warmup_bars(&self) -> u32 {
        self.period * 2 + 1
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        let need = self.warmup_bars() as usize;
        if bars.len() < need {
            return None;
        }
        let window: Vec<&Bar> = bars.iter().rev().take(need).collect();
        let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        Some(IndicatorValue::HighLow { high, low })
    }
}

/// Rolling N-bar high/low (e.g. `high_low_52_1w`); warmup N per spec §4.2.
pub struct HighLowN {
    pub period: u32,
    pub interval: Interval,
}
impl Indicator for HighLowN {
    fn warmup_bars(&self) -> u32 {
        self.period
    }
    fn required_interval(&self) -> Interval {
        self.interval
    }
    fn update(&self, _state: &mut IndicatorState, bars: &VecDeque<Bar>) -> Option<IndicatorValue> {
        if bars.len() < self.period as usize {
            return None;
        }
        let window: Vec<&Bar> = bars.iter().rev().take(self.period as usize).collect();
        let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        Some(IndicatorValue::HighLow { high, low })
    }
}

/// String→constructor map, per spec §9's "dynamic/duck typing" note.
pub struct IndicatorRegistry;

impl IndicatorRegistry {
    pub fn build(config: &IndicatorConfig) -> Option<Box<dyn Indicator>> {
        let period = config.period.unwrap_or(0);
        let interval = config.interval;
        match config.name.as_str() {
            "sma" => Some(Box::new(Sma { period, interval })),
            "wma" => Some(Box::new(Wma { period, interval })),
            "ema" => Some(Box::new(Ema { period, interval })),
            "dema" => Some(Box::new(Dema { period, interval })),
            "tema" => Some(Box::new(Tema { period, interval })),
            "rsi" => Some(Box::new(Rsi { period, interval })),
            "macd" => {
                let fast = config.params.get("fast").copied().unwrap_or(12.0) as u32;
                let slow = config.params.get("slow").copied().unwrap_or(26.0) as u32;
                let signal = config.params.get("signal").copied().unwrap_or(9.0) as u32;
                Some(Box::new(Macd { fast, slow, signal, interval }))
            }
            "bollinger" => {
                let k = config.params.get("k").copied().unwrap_or(2.0);
                Some(Box::new(Bollinger { period, k, interval }))
            }
            "vwap" => Some(Box::new(Vwap { interval })),
            "obv" => Some(Box::new(Obv { interval })),
            "stoch" | "stochastic" => {
                let smooth = config.params.get("smooth").copied().unwrap_or(3.0) as u32;
                Some(Box::new(Stochastic { period, smooth, interval }))
            }
            "swing_high_low" => Some(Box::new(SwingHighLow { period, interval })),
            "high_low" => Some(Box::new(HighLowN { period, interval })),
            _ => None,
        }
    }

    /// Warmup bars for a config without constructing (used by
    /// `RequirementAnalyzer`, which needs the number before any bars
    /// exist).
    pub fn warmup_bars(config: &IndicatorConfig) -> Option<u32> {
        Self::build(config).map(|i| i.warmup_bars())
    }

    pub fn key(config: &IndicatorConfig) -> String {
        let period = if config.name == "vwap" || config.name == "obv" {
            None
        } else {
            config.period
        };
        indicator_key(&config.name, period, config.interval)
    }
}
