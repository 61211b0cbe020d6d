//! Free-form time parser.
//!
//! Turns text such as `in 10 minutes`, `every monday 18:00 UTC+1` or
//! `<t:1700000000:R>` into an absolute time, an optional repeat hint, and
//! whatever text follows the time expression.
//!
//! Grammars are tried in a fixed order and the first match wins:
//!
//! 1. Discord timestamp: `<t:SECONDS[:STYLE]>`
//! 2. Interval: `[in|every] <n> <unit>`
//! 3. Clock time: `[at|every] HH:MM <offset>`
//! 4. Weekday: `[on|every] <weekday> HH:MM <offset>`
//! 5. Date: `[on|every] <day>[st|nd|rd|th] <month> [year] HH:MM <offset>`
//!
//! When nothing matches, the error of the grammar that got furthest is returned.

use std::fmt;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Month, Months, NaiveDate, NaiveTime, TimeZone, Utc,
    Weekday,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<t:(-?\d+)(?::[A-Za-z])?>$").expect("valid timestamp regex"));

static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid clock regex"));

static OFFSET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:UTC|GMT)(?:([+-])(\d{1,2})(?::?(\d{2}))?)?|([+-])(\d{1,2}):?(\d{2}))$")
        .expect("valid offset regex")
});

static DAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d{1,2})(?:st|nd|rd|th)?$").expect("valid day regex"));

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid year regex"));

const INTERVAL_UNITS: &str = "seconds, minutes, hours, days, months, years";

/// Recurrence suggested by the wording of a time expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatHint {
    /// `every <n> <unit>`
    Relative,
    /// `every HH:MM`
    Daily,
    /// `every <weekday> HH:MM`
    Weekly,
    /// `every <day> <month> HH:MM`
    Yearly,
}

/// Successful parse result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDateTime {
    /// Absolute time, keeping the offset the user wrote (UTC otherwise).
    pub time: DateTime<FixedOffset>,
    pub repeat: Option<RepeatHint>,
    /// Text after the time expression, for use as message content.
    pub remaining: String,
}

/// A parse failure naming the offending input and why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeParseError {
    /// The fragment that could not be understood.
    pub token: String,
    pub reason: String,
    /// Tokens matched before the failure; used to pick the closest grammar.
    pub consumed: usize,
}

impl TimeParseError {
    pub fn new(token: impl Into<String>, reason: impl Into<String>, consumed: usize) -> Self {
        Self {
            token: token.into(),
            reason: reason.into(),
            consumed,
        }
    }
}

impl fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token.is_empty() {
            write!(f, "the time is {}", self.reason)
        } else {
            write!(f, "`{}` is {}", self.token, self.reason)
        }
    }
}

impl std::error::Error for TimeParseError {}

type ParseResult<T> = std::result::Result<T, TimeParseError>;

/// Parse a time expression relative to `now`.
pub fn parse(text: &str, now: DateTime<Utc>) -> ParseResult<ParsedDateTime> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(TimeParseError::new("", "missing", 0));
    }

    let grammars: [fn(&mut Cursor<'_, '_>, DateTime<Utc>) -> ParseResult<Resolved>; 5] = [
        parse_timestamp,
        parse_interval,
        parse_clock,
        parse_weekday,
        parse_date,
    ];

    let mut best: Option<TimeParseError> = None;
    for grammar in grammars {
        let mut cursor = Cursor::new(&tokens);
        match grammar(&mut cursor, now) {
            Ok(resolved) => {
                let remaining = tokens
                    .get(cursor.pos)
                    .map(|t| text[t.start..].trim().to_string())
                    .unwrap_or_default();
                return Ok(ParsedDateTime {
                    time: resolved.time,
                    repeat: resolved.repeat,
                    remaining,
                });
            }
            Err(err) => {
                if best.as_ref().map_or(true, |b| err.consumed > b.consumed) {
                    best = Some(err);
                }
            }
        }
    }

    match best {
        Some(err) if err.consumed > 0 => Err(err),
        _ => Err(TimeParseError::new(
            tokens[0].text,
            "not a time; try `in 10 minutes`, `at 14:00 UTC+0`, `on monday 14:00 UTC+0` \
             or `on 1 jan 2030 14:00 UTC+0`",
            0,
        )),
    }
}

struct Token<'a> {
    start: usize,
    text: &'a str,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(Token {
                    start: s,
                    text: &text[s..i],
                });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            text: &text[s..],
        });
    }
    tokens
}

struct Resolved {
    time: DateTime<FixedOffset>,
    repeat: Option<RepeatHint>,
}

struct Cursor<'t, 'a> {
    tokens: &'t [Token<'a>],
    pos: usize,
}

impl<'t, 'a> Cursor<'t, 'a> {
    fn new(tokens: &'t [Token<'a>]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(|t| t.text)
    }

    fn previous(&self) -> &'a str {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or("", |t| t.text)
    }

    /// Consume a leading keyword if it is one of `allowed`.
    fn keyword(&mut self, allowed: &[&str]) -> Option<String> {
        let word = self.peek()?.to_lowercase();
        if allowed.contains(&word.as_str()) {
            self.pos += 1;
            Some(word)
        } else {
            None
        }
    }

    /// Consume the next token if `convert` accepts it.
    ///
    /// `reason` describes a rejected token, `missing` an exhausted input.
    fn expect<T>(
        &mut self,
        convert: impl FnOnce(&str) -> Option<T>,
        reason: &str,
        missing: &str,
    ) -> ParseResult<T> {
        let Some(token) = self.peek() else {
            return Err(self.fail(self.previous(), missing));
        };
        match convert(token) {
            Some(value) => {
                self.pos += 1;
                Ok(value)
            }
            None => Err(self.fail(token, reason)),
        }
    }

    fn fail(&self, token: &str, reason: &str) -> TimeParseError {
        TimeParseError::new(token, reason, self.pos)
    }

    /// Text covered by tokens `from..self.pos`.
    fn span(&self, from: usize) -> String {
        self.tokens[from..self.pos]
            .iter()
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_timestamp(cursor: &mut Cursor<'_, '_>, _now: DateTime<Utc>) -> ParseResult<Resolved> {
    let token = cursor.peek().unwrap_or_default();
    let seconds = TIMESTAMP_RE
        .captures(token)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    match seconds {
        Some(time) => {
            cursor.pos += 1;
            Ok(Resolved {
                time: time.fixed_offset(),
                repeat: None,
            })
        }
        None => {
            // Claim the token when it at least looks like a timestamp
            let consumed = usize::from(token.starts_with("<t:"));
            Err(TimeParseError::new(token, "not a Discord timestamp", consumed))
        }
    }
}

fn parse_interval(cursor: &mut Cursor<'_, '_>, now: DateTime<Utc>) -> ParseResult<Resolved> {
    let repeating = cursor.keyword(&["in", "every"]).as_deref() == Some("every");

    let amount = cursor.expect(
        |t| t.parse::<u32>().ok().filter(|n| *n > 0),
        "not a positive integer",
        "missing an amount",
    )?;

    let unit_token = cursor.peek();
    let unit = cursor.expect(
        IntervalUnit::parse,
        &format!("not one of the interval units: {}", INTERVAL_UNITS),
        &format!("missing a unit ({})", INTERVAL_UNITS),
    )?;

    let start = now.fixed_offset();
    let time = unit.add_to(start, amount).ok_or_else(|| {
        TimeParseError::new(
            format!("{} {}", amount, unit_token.unwrap_or_default()),
            "too far in the future",
            cursor.pos,
        )
    })?;

    Ok(Resolved {
        time,
        repeat: repeating.then_some(RepeatHint::Relative),
    })
}

fn parse_clock(cursor: &mut Cursor<'_, '_>, now: DateTime<Utc>) -> ParseResult<Resolved> {
    let repeating = cursor.keyword(&["at", "every"]).as_deref() == Some("every");
    let (clock, offset) = clock_with_offset(cursor)?;

    let today = now.with_timezone(&offset).date_naive();
    let mut time = localize(today, clock, offset, cursor)?;
    if time <= now {
        time = localize(today + Duration::days(1), clock, offset, cursor)?;
    }

    Ok(Resolved {
        time,
        repeat: repeating.then_some(RepeatHint::Daily),
    })
}

fn parse_weekday(cursor: &mut Cursor<'_, '_>, now: DateTime<Utc>) -> ParseResult<Resolved> {
    let repeating = cursor.keyword(&["on", "every"]).as_deref() == Some("every");

    let weekday = cursor.expect(
        |t| t.parse::<Weekday>().ok(),
        "not a day of the week",
        "missing a day of the week",
    )?;
    let (clock, offset) = clock_with_offset(cursor)?;

    let today = now.with_timezone(&offset).date_naive();
    let days_ahead = (7 + weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    let mut time = localize(today + Duration::days(days_ahead), clock, offset, cursor)?;
    // Today only counts while the time is still ahead
    if time <= now {
        time = localize(today + Duration::days(days_ahead + 7), clock, offset, cursor)?;
    }

    Ok(Resolved {
        time,
        repeat: repeating.then_some(RepeatHint::Weekly),
    })
}

fn parse_date(cursor: &mut Cursor<'_, '_>, now: DateTime<Utc>) -> ParseResult<Resolved> {
    let repeating = cursor.keyword(&["on", "every"]).as_deref() == Some("every");
    let date_start = cursor.pos;

    let day = cursor.expect(
        |t| {
            DAY_RE
                .captures(t)
                .and_then(|caps| caps[1].parse::<u32>().ok())
                .filter(|d| (1..=31).contains(d))
        },
        "not a day of the month",
        "missing a day of the month",
    )?;
    let month = cursor.expect(
        |t| t.parse::<Month>().ok(),
        "not a month name",
        "missing a month",
    )?;
    let year = match cursor.peek() {
        Some(t) if YEAR_RE.is_match(t) => {
            cursor.pos += 1;
            t.parse::<i32>().ok()
        }
        _ => None,
    };
    let date_text = cursor.span(date_start);

    let (clock, offset) = clock_with_offset(cursor)?;
    let month_number = month.number_from_month();

    match (year, repeating) {
        (Some(_), true) => Err(TimeParseError::new(
            date_text,
            "a single date and can't repeat; drop the year or `every`",
            cursor.pos,
        )),
        (None, false) => Err(TimeParseError::new(
            date_text,
            "missing a year (only `every` dates may leave it out)",
            cursor.pos,
        )),
        (Some(year), false) => {
            let date = NaiveDate::from_ymd_opt(year, month_number, day).ok_or_else(|| {
                TimeParseError::new(date_text.clone(), "not a valid calendar date", cursor.pos)
            })?;
            Ok(Resolved {
                time: localize(date, clock, offset, cursor)?,
                repeat: None,
            })
        }
        (None, true) => {
            // Feb 29 may be up to eight years away (e.g. 2097 -> 2104)
            let this_year = now.with_timezone(&offset).year();
            for year in this_year..=this_year + 8 {
                let Some(date) = NaiveDate::from_ymd_opt(year, month_number, day) else {
                    continue;
                };
                let time = localize(date, clock, offset, cursor)?;
                if time >= now {
                    return Ok(Resolved {
                        time,
                        repeat: Some(RepeatHint::Yearly),
                    });
                }
            }
            Err(TimeParseError::new(
                date_text,
                "not a valid calendar date",
                cursor.pos,
            ))
        }
    }
}

/// `HH:MM` followed by a mandatory UTC offset.
fn clock_with_offset(cursor: &mut Cursor<'_, '_>) -> ParseResult<(NaiveTime, FixedOffset)> {
    let clock = cursor.expect(
        |t| {
            let caps = CLOCK_RE.captures(t)?;
            let hour = caps[1].parse().ok()?;
            let minute = caps[2].parse().ok()?;
            NaiveTime::from_hms_opt(hour, minute, 0)
        },
        "not a time of day (expected HH:MM)",
        "missing a time of day (HH:MM)",
    )?;
    let offset = cursor.expect(
        parse_offset,
        "not a UTC offset (e.g. UTC+2 or UTC-05:30)",
        "missing a UTC offset",
    )?;
    Ok((clock, offset))
}

fn parse_offset(token: &str) -> Option<FixedOffset> {
    let caps = OFFSET_RE.captures(token)?;
    let (sign, hours, minutes) = match (caps.get(1), caps.get(4)) {
        (Some(sign), _) => (sign.as_str(), caps.get(2), caps.get(3)),
        (None, Some(sign)) => (sign.as_str(), caps.get(5), caps.get(6)),
        // Bare UTC/GMT
        (None, None) => return FixedOffset::east_opt(0),
    };
    let hours: i32 = hours?.as_str().parse().ok()?;
    let minutes: i32 = minutes.map_or(Some(0), |m| m.as_str().parse().ok())?;
    if hours > 14 || minutes >= 60 {
        return None;
    }
    let seconds = hours * 3600 + minutes * 60;
    FixedOffset::east_opt(if sign == "-" { -seconds } else { seconds })
}

fn localize(
    date: NaiveDate,
    clock: NaiveTime,
    offset: FixedOffset,
    cursor: &Cursor<'_, '_>,
) -> ParseResult<DateTime<FixedOffset>> {
    offset
        .from_local_datetime(&date.and_time(clock))
        .single()
        .ok_or_else(|| cursor.fail(cursor.previous(), "not a representable time"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

impl IntervalUnit {
    fn parse(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "second" | "seconds" => Some(Self::Seconds),
            "minute" | "minutes" => Some(Self::Minutes),
            "hour" | "hours" => Some(Self::Hours),
            "day" | "days" => Some(Self::Days),
            "month" | "months" => Some(Self::Months),
            "year" | "years" => Some(Self::Years),
            _ => None,
        }
    }

    fn add_to(self, start: DateTime<FixedOffset>, amount: u32) -> Option<DateTime<FixedOffset>> {
        let n = i64::from(amount);
        match self {
            Self::Seconds => start.checked_add_signed(Duration::try_seconds(n)?),
            Self::Minutes => start.checked_add_signed(Duration::try_minutes(n)?),
            Self::Hours => start.checked_add_signed(Duration::try_hours(n)?),
            Self::Days => start.checked_add_signed(Duration::try_days(n)?),
            Self::Months => start.checked_add_months(Months::new(amount)),
            Self::Years => start.checked_add_months(Months::new(amount.checked_mul(12)?)),
        }
    }
}


#[cfg(test)]
mod property_tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::timeparse::{parse, RepeatHint};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// `in N minutes` always lands exactly N minutes after now with no repeat.
        #[test]
        fn prop_interval_minutes(n in 1u32..100_000, offset_secs in 0i64..400_000_000) {
            let now = Utc.timestamp_opt(1_000_000_000 + offset_secs, 0).unwrap();
            let parsed = parse(&format!("in {} minutes", n), now).unwrap();
            prop_assert_eq!(parsed.time, now + Duration::minutes(n as i64));
            prop_assert_eq!(parsed.repeat, None);
            prop_assert_eq!(parsed.remaining, "");
        }

        /// Weekday times are strictly in the future and less than a week away.
        #[test]
        fn prop_weekday_within_week(
            day in 0usize..7,
            hour in 0u32..24,
            minute in 0u32..60,
            offset_secs in 0i64..400_000_000,
        ) {
            let names = ["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"];
            let now = Utc.timestamp_opt(1_000_000_000 + offset_secs, 0).unwrap();
            let text = format!("every {} {:02}:{:02} UTC+0", names[day], hour, minute);
            let parsed = parse(&text, now).unwrap();
            prop_assert_eq!(parsed.repeat, Some(RepeatHint::Weekly));
            prop_assert!(parsed.time > now);
            prop_assert!(parsed.time <= now + Duration::days(7));
        }
    }
}
