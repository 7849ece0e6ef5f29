use chrono::{Datelike, NaiveDate};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Invalid date range: {start} .. {end}, the end has to be after the start")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("Date '{0}' is not of the form YYYY-MM-DD")]
    InvalidDate(String),
    #[error("The number of years per chunk has to be at least 1")]
    ZeroChunk,
}

/// Half-open calendar range `[start, end)` assigned to a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start, self.end)
    }
}

/// parse the leading `YYYY-MM-DD` of a date(-time) value
pub fn parse_date(value: &str) -> Result<NaiveDate, WindowError> {
    let value = value.trim();

    value
        .get(..10)
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .ok_or_else(|| WindowError::InvalidDate(value.to_owned()))
}

/// Split `[start, end)` into contiguous windows of at most `years_per_chunk` years.
///
/// The years `year(start) .. year(end)` are divided into `ceil(total / years_per_chunk)`
/// groups of near-equal size, larger groups first. Every group but the first starts on
/// January 1 of its first year, the first window starts at the literal `start` and the
/// last one ends at the literal `end`.
pub fn split(
    start: NaiveDate,
    end: NaiveDate,
    years_per_chunk: u32,
) -> Result<Vec<Window>, WindowError> {
    if years_per_chunk == 0 {
        return Err(WindowError::ZeroChunk);
    }

    if end <= start {
        return Err(WindowError::InvalidRange { start, end });
    }

    // end > start implies end year >= start year
    let total_years = (end.year() - start.year()) as u32;
    let chunks = total_years.div_ceil(years_per_chunk).max(1);

    let mut boundaries = Vec::with_capacity(chunks as usize + 1);
    boundaries.push(start);

    if total_years > 0 {
        let (size, remainder) = (total_years / chunks, total_years % chunks);
        let mut year = start.year();

        for group in 0..chunks - 1 {
            year += (size + u32::from(group < remainder)) as i32;

            match NaiveDate::from_ymd_opt(year, 1, 1) {
                Some(boundary) => boundaries.push(boundary),
                None => return Err(WindowError::InvalidRange { start, end }),
            }
        }
    }

    boundaries.push(end);

    Ok(boundaries
        .windows(2)
        .map(|pair| Window {
            start: pair[0],
            end: pair[1],
        })
        .collect())
}
