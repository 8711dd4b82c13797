use anyhow::{bail, Context, Result};
use chrono::DateTime;
use polars::prelude::*;

use super::{Candle, CandleSeries, Timeframe};

pub const TIMESTAMP_COL: &str = "timestamp";
pub const OHLCV_COLS: [&str; 6] = [TIMESTAMP_COL, "open", "high", "low", "close", "volume"];

/// Convert a fetcher `DataFrame` into a validated `CandleSeries`.
///
/// The frame must carry the columns in `OHLCV_COLS`, with `timestamp` as a
/// UTC datetime column sorted ascending. Rows with null fields are rejected:
/// the fetcher contract promises complete candles, so a hole means the
/// upstream response is unusable.
pub fn series_from_dataframe(
    df: &DataFrame,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<CandleSeries> {
    let timestamps = df
        .column(TIMESTAMP_COL)
        .with_context(|| format!("OHLCV frame for {symbol} missing '{TIMESTAMP_COL}'"))?;
    let opens = df.column("open")?.f64()?;
    let highs = df.column("high")?.f64()?;
    let lows = df.column("low")?.f64()?;
    let closes = df.column("close")?.f64()?;
    let volumes = df.column("volume")?.f64()?;

    let mut candles = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ts = extract_utc_timestamp(timestamps, i)?;
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            opens.get(i),
            highs.get(i),
            lows.get(i),
            closes.get(i),
            volumes.get(i),
        ) else {
            bail!("null OHLCV field at row {i} for {symbol} {timeframe}");
        };
        candles.push(Candle {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    CandleSeries::new(symbol, timeframe, candles)
        .with_context(|| format!("invalid OHLCV series for {symbol} {timeframe}"))
}

/// Render a candle slice back into the fetcher-facing frame layout.
pub fn dataframe_from_candles(candles: &[Candle]) -> Result<DataFrame> {
    let timestamps: Vec<_> = candles.iter().map(|c| c.timestamp.naive_utc()).collect();
    let df = df! {
        TIMESTAMP_COL => &timestamps,
        "open" => candles.iter().map(|c| c.open).collect::<Vec<_>>(),
        "high" => candles.iter().map(|c| c.high).collect::<Vec<_>>(),
        "low" => candles.iter().map(|c| c.low).collect::<Vec<_>>(),
        "close" => candles.iter().map(|c| c.close).collect::<Vec<_>>(),
        "volume" => candles.iter().map(|c| c.volume).collect::<Vec<_>>(),
    }?;
    Ok(df)
}

fn extract_utc_timestamp(col: &Column, idx: usize) -> Result<chrono::DateTime<chrono::Utc>> {
    match col.dtype() {
        DataType::Datetime(tu, _) => {
            let val = col.datetime()?.phys.get(idx);
            let Some(v) = val else {
                bail!("null timestamp at row {idx}");
            };
            let dt = match tu {
                TimeUnit::Milliseconds => DateTime::from_timestamp_millis(v),
                TimeUnit::Microseconds => DateTime::from_timestamp_micros(v),
                TimeUnit::Nanoseconds => {
                    let secs = v / 1_000_000_000;
                    let nsecs = (v % 1_000_000_000) as u32;
                    DateTime::from_timestamp(secs, nsecs)
                }
            };
            dt.ok_or_else(|| anyhow::anyhow!("invalid timestamp value at row {idx}"))
        }
        other => bail!("unsupported timestamp dtype: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn make_candles(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let price = 100.0 + i as f64;
                Candle {
                    timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                        + chrono::Duration::hours(i),
                    open: price,
                    high: price + 1.0,
                    low: price - 1.0,
                    close: price + 0.5,
                    volume: 500.0,
                }
            })
            .collect()
    }

    #[test]
    fn round_trip_preserves_candles() {
        let candles = make_candles(10);
        let df = dataframe_from_candles(&candles).unwrap();
        let series = series_from_dataframe(&df, "BTC", Timeframe::H1).unwrap();
        assert_eq!(series.candles(), candles.as_slice());
    }

    #[test]
    fn missing_column_is_an_error() {
        let candles = make_candles(3);
        let df = dataframe_from_candles(&candles).unwrap();
        let df = df.drop("volume").unwrap();
        let err = series_from_dataframe(&df, "BTC", Timeframe::H1).unwrap_err();
        assert!(err.to_string().contains("volume") || err.root_cause().to_string().contains("volume"));
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let mut candles = make_candles(3);
        candles[1].low = candles[1].high + 5.0;
        let df = dataframe_from_candles(&candles).unwrap();
        assert!(series_from_dataframe(&df, "BTC", Timeframe::H1).is_err());
    }
}
