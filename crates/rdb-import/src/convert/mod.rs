//! Per-column value conversion.
//!
//! A [`Reader`] is chosen once per column when a table load starts, from the
//! target field type and the declared source type. Combinations that cannot
//! be converted are rejected at that point, so the per-row path never has to
//! check for them.

pub mod blob;
pub mod synth_key;

pub use blob::{BlobSaver, BLOB_BLOCK_SIZE};
pub use synth_key::SynthKey;

use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use uuid::Uuid;

use crate::core::schema::SqlType;
use crate::core::value::{TargetType, TargetValue};
use crate::error::{ImportError, Result};
use crate::source::SourceRow;

/// How one column is read from the source and shaped for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvMode {
    Bool,
    /// Numeric source, non-zero is true.
    IntToBool,
    /// Character source, see [`str2bool`].
    StrToBool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    Decimal,
    /// Decimal parsed from the driver's text form.
    DecimalText,
    Text,
    Bytes,
    Date,
    /// Calendar date of a timestamp source.
    TsDate,
    Datetime,
    Timestamp,
    /// `YYYYMMDD` as a signed 32-bit integer.
    DateInt32,
    DateInt64,
    DateUint32,
    DateUint64,
    /// Seconds since midnight.
    TimeInt32,
    /// Epoch milliseconds.
    TsInt64,
    TsUint64,
    DateText,
    TimeText,
    TsText,
    UuidText,
    UuidBinary,
}

/// Text layout of dates converted to strings.
pub const DATE_TEXT_FORMAT: &str = "%Y/%m/%d";
/// Text layout of timestamps converted to strings.
pub const TIMESTAMP_TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
/// Text layout of times converted to strings.
pub const TIME_TEXT_FORMAT: &str = "%H:%M:%S%.f";

/// Broad family of a declared source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Bool,
    Number,
    Char,
    Binary,
    Date,
    Time,
    Timestamp,
    Unknown,
}

impl SourceKind {
    fn of(sql_type: SqlType) -> Self {
        match sql_type {
            SqlType::Boolean | SqlType::Bit => SourceKind::Bool,
            SqlType::Float | SqlType::Real | SqlType::Double => SourceKind::Number,
            t if t.is_numeric() => SourceKind::Number,
            t if t.is_character() => SourceKind::Char,
            t if t.is_binary() => SourceKind::Binary,
            SqlType::Date => SourceKind::Date,
            SqlType::Time | SqlType::TimeWithTimezone => SourceKind::Time,
            SqlType::Timestamp | SqlType::TimestampWithTimezone => SourceKind::Timestamp,
            _ => SourceKind::Unknown,
        }
    }

    fn is_scalar(self) -> bool {
        matches!(self, SourceKind::Bool | SourceKind::Number | SourceKind::Char)
    }
}

/// Select the conversion for one column. `None` when the source type cannot
/// feed the target type. Large objects are not read through a `Reader`.
pub fn select_reader(target: TargetType, source: SqlType, native_decimals: bool) -> Option<Reader> {
    use SourceKind as K;
    let kind = SourceKind::of(source);
    let mode = match target {
        TargetType::Bool => match kind {
            K::Bool => ConvMode::Bool,
            K::Number => ConvMode::IntToBool,
            K::Char => ConvMode::StrToBool,
            _ => return None,
        },
        TargetType::Int32 => match kind {
            K::Time => ConvMode::TimeInt32,
            K::Date => ConvMode::DateInt32,
            k if k.is_scalar() => ConvMode::Int32,
            _ => return None,
        },
        TargetType::Int64 => match kind {
            K::Date => ConvMode::DateInt64,
            K::Timestamp => ConvMode::TsInt64,
            k if k.is_scalar() => ConvMode::Int64,
            _ => return None,
        },
        TargetType::Uint32 => match kind {
            K::Date => ConvMode::DateUint32,
            k if k.is_scalar() => ConvMode::Uint32,
            _ => return None,
        },
        TargetType::Uint64 => match kind {
            K::Date => ConvMode::DateUint64,
            K::Timestamp => ConvMode::TsUint64,
            k if k.is_scalar() => ConvMode::Uint64,
            _ => return None,
        },
        TargetType::Float => match kind {
            K::Number | K::Char => ConvMode::Float,
            _ => return None,
        },
        TargetType::Double => match kind {
            K::Number | K::Char => ConvMode::Double,
            _ => return None,
        },
        TargetType::Decimal { .. } => match kind {
            K::Number | K::Char if native_decimals => ConvMode::Decimal,
            K::Number | K::Char => ConvMode::DecimalText,
            _ => return None,
        },
        TargetType::Text => match kind {
            K::Date => ConvMode::DateText,
            K::Time => ConvMode::TimeText,
            K::Timestamp => ConvMode::TsText,
            K::Binary => return None,
            _ => ConvMode::Text,
        },
        TargetType::Bytes => match kind {
            K::Binary | K::Char | K::Unknown => ConvMode::Bytes,
            _ => return None,
        },
        TargetType::Date | TargetType::Date32 => match kind {
            K::Date => ConvMode::Date,
            K::Timestamp => ConvMode::TsDate,
            _ => return None,
        },
        TargetType::Datetime | TargetType::Datetime64 => match kind {
            K::Date | K::Timestamp => ConvMode::Datetime,
            _ => return None,
        },
        TargetType::Timestamp | TargetType::Timestamp64 => match kind {
            K::Date | K::Timestamp => ConvMode::Timestamp,
            _ => return None,
        },
        TargetType::Uuid => match kind {
            K::Binary => ConvMode::UuidBinary,
            K::Char | K::Unknown => ConvMode::UuidText,
            _ => return None,
        },
    };
    Some(Reader { mode, target })
}

/// A resolved column conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reader {
    pub mode: ConvMode,
    pub target: TargetType,
}

impl Reader {
    /// Read column `idx` of the current row. When a key accumulator is
    /// given, the native value's encoding is fed into it.
    pub fn read<R: SourceRow + ?Sized>(
        &self,
        row: &R,
        idx: usize,
        key: Option<&mut SynthKey>,
    ) -> Result<TargetValue> {
        match self.mode {
            ConvMode::Bool => self.with(row.get_bool(idx)?, key, |k, v| k.put_bool(*v), |v| {
                Ok(TargetValue::Bool(v))
            }),
            ConvMode::IntToBool => self.with(row.get_i32(idx)?, key, |k, v| k.put_i32(*v), |v| {
                Ok(TargetValue::Bool(v != 0))
            }),
            ConvMode::StrToBool => {
                self.with(row.get_string(idx)?, key, |k, v| k.put_str(v), |v| {
                    Ok(TargetValue::Bool(str2bool(&v)))
                })
            }
            ConvMode::Int32 => self.with(row.get_i32(idx)?, key, |k, v| k.put_i32(*v), |v| {
                Ok(TargetValue::Int32(v))
            }),
            ConvMode::Int64 => self.with(row.get_i64(idx)?, key, |k, v| k.put_i64(*v), |v| {
                Ok(TargetValue::Int64(v))
            }),
            ConvMode::Uint32 => self.with(row.get_i64(idx)?, key, |k, v| k.put_i64(*v), |v| {
                u32::try_from(v)
                    .map(TargetValue::Uint32)
                    .map_err(|_| out_of_range(v, "Uint32"))
            }),
            ConvMode::Uint64 => self.with(row.get_i64(idx)?, key, |k, v| k.put_i64(*v), |v| {
                u64::try_from(v)
                    .map(TargetValue::Uint64)
                    .map_err(|_| out_of_range(v, "Uint64"))
            }),
            ConvMode::Float => self.with(row.get_f32(idx)?, key, |k, v| k.put_f32(*v), |v| {
                Ok(TargetValue::Float(v))
            }),
            ConvMode::Double => self.with(row.get_f64(idx)?, key, |k, v| k.put_f64(*v), |v| {
                Ok(TargetValue::Double(v))
            }),
            ConvMode::Decimal => {
                self.with(row.get_decimal(idx)?, key, |k, v| k.put_decimal(v), |v| {
                    self.decimal(v)
                })
            }
            ConvMode::DecimalText => {
                let parsed = row.get_string(idx)?.map(|s| parse_decimal(&s)).transpose()?;
                self.with(parsed, key, |k, v| k.put_decimal(v), |v| self.decimal(v))
            }
            ConvMode::Text => self.with(row.get_string(idx)?, key, |k, v| k.put_str(v), |v| {
                Ok(TargetValue::Text(v))
            }),
            ConvMode::Bytes => self.with(row.get_bytes(idx)?, key, |k, v| k.put_bytes(v), |v| {
                Ok(TargetValue::Bytes(v))
            }),
            ConvMode::Date => self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                Ok(TargetValue::Date(v))
            }),
            ConvMode::TsDate => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    Ok(TargetValue::Date(v.date()))
                })
            }
            ConvMode::Datetime => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    Ok(TargetValue::Datetime(truncate_nanos(v, 1_000_000_000)))
                })
            }
            ConvMode::Timestamp => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    Ok(TargetValue::Timestamp(truncate_nanos(v, 1_000)))
                })
            }
            ConvMode::DateInt32 => self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                Ok(TargetValue::Int32(date2int(v)))
            }),
            ConvMode::DateInt64 => self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                Ok(TargetValue::Int64(date2int(v) as i64))
            }),
            ConvMode::DateUint32 => {
                self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                    let n = date2int(v);
                    u32::try_from(n)
                        .map(TargetValue::Uint32)
                        .map_err(|_| out_of_range(n as i64, "Uint32"))
                })
            }
            ConvMode::DateUint64 => {
                self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                    let n = date2int(v);
                    u64::try_from(n)
                        .map(TargetValue::Uint64)
                        .map_err(|_| out_of_range(n as i64, "Uint64"))
                })
            }
            ConvMode::TimeInt32 => self.with(row.get_time(idx)?, key, |k, v| k.put_time(*v), |v| {
                Ok(TargetValue::Int32(v.num_seconds_from_midnight() as i32))
            }),
            ConvMode::TsInt64 => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    Ok(TargetValue::Int64(v.and_utc().timestamp_millis()))
                })
            }
            ConvMode::TsUint64 => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    let millis = v.and_utc().timestamp_millis();
                    u64::try_from(millis)
                        .map(TargetValue::Uint64)
                        .map_err(|_| out_of_range(millis, "Uint64"))
                })
            }
            ConvMode::DateText => self.with(row.get_date(idx)?, key, |k, v| k.put_date(*v), |v| {
                Ok(TargetValue::Text(v.format(DATE_TEXT_FORMAT).to_string()))
            }),
            ConvMode::TimeText => self.with(row.get_time(idx)?, key, |k, v| k.put_time(*v), |v| {
                Ok(TargetValue::Text(v.format(TIME_TEXT_FORMAT).to_string()))
            }),
            ConvMode::TsText => {
                self.with(row.get_timestamp(idx)?, key, |k, v| k.put_timestamp(*v), |v| {
                    Ok(TargetValue::Text(v.format(TIMESTAMP_TEXT_FORMAT).to_string()))
                })
            }
            ConvMode::UuidText => self.with(row.get_uuid(idx)?, key, |k, v| k.put_uuid(v), |v| {
                Ok(TargetValue::Uuid(v))
            }),
            ConvMode::UuidBinary => {
                self.with(row.get_bytes(idx)?, key, |k, v| k.put_bytes(v), |v| {
                    Uuid::from_slice(&v)
                        .map(TargetValue::Uuid)
                        .map_err(|e| ImportError::Value(format!("invalid uuid bytes: {}", e)))
                })
            }
        }
    }

    fn with<T>(
        &self,
        value: Option<T>,
        key: Option<&mut SynthKey>,
        feed: impl FnOnce(&mut SynthKey, &T),
        convert: impl FnOnce(T) -> Result<TargetValue>,
    ) -> Result<TargetValue> {
        match value {
            None => {
                if let Some(key) = key {
                    key.put_null();
                }
                Ok(TargetValue::Null(self.target))
            }
            Some(v) => {
                if let Some(key) = key {
                    feed(key, &v);
                }
                convert(v)
            }
        }
    }

    /// Round to the target scale, then reject values whose integer part
    /// does not fit the target precision.
    fn decimal(&self, v: BigDecimal) -> Result<TargetValue> {
        let TargetType::Decimal { precision, scale } = self.target else {
            return Ok(TargetValue::Decimal(v));
        };
        let rounded = v.with_scale_round(i64::from(scale), RoundingMode::HalfEven);
        let int_digits = rounded.digits() as i64 - i64::from(scale);
        if int_digits > i64::from(precision) - i64::from(scale) {
            return Err(ImportError::Value(format!(
                "value {} does not fit {}",
                v, self.target
            )));
        }
        Ok(TargetValue::Decimal(rounded))
    }
}

fn out_of_range(v: i64, ty: &str) -> ImportError {
    ImportError::Value(format!("value {} is out of range for {}", v, ty))
}

fn parse_decimal(text: &str) -> Result<BigDecimal> {
    let text = text.trim();
    BigDecimal::from_str(text)
        .map_err(|e| ImportError::Value(format!("invalid decimal {:?}: {}", text, e)))
}

fn truncate_nanos(v: NaiveDateTime, step: u32) -> NaiveDateTime {
    v.with_nanosecond(v.nanosecond() / step * step).unwrap_or(v)
}

/// Boolean meaning of a character value. Empty text is false, and so is
/// text whose first character is one of `N`, `0`, `F`, `Н` or `Л` in either
/// case. Anything else is true.
pub fn str2bool(text: &str) -> bool {
    match text.trim().chars().next() {
        None => false,
        Some(c) => !matches!(
            c,
            'N' | 'n' | '0' | 'F' | 'f' | 'Н' | 'н' | 'Л' | 'л'
        ),
    }
}

/// `YYYYMMDD` as a number.
pub fn date2int(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryRow;
    use crate::core::value::SourceValue;
    use chrono::NaiveTime;

    fn row(values: Vec<SourceValue>) -> MemoryRow {
        MemoryRow::new(values)
    }

    fn reader(target: TargetType, source: SqlType) -> Reader {
        select_reader(target, source, true).unwrap()
    }

    #[test]
    fn test_mode_selection() {
        let cases = [
            (TargetType::Bool, SqlType::Boolean, ConvMode::Bool),
            (TargetType::Bool, SqlType::Integer, ConvMode::IntToBool),
            (TargetType::Bool, SqlType::Char, ConvMode::StrToBool),
            (TargetType::Int32, SqlType::Date, ConvMode::DateInt32),
            (TargetType::Int32, SqlType::Time, ConvMode::TimeInt32),
            (TargetType::Int32, SqlType::Numeric, ConvMode::Int32),
            (TargetType::Int64, SqlType::Timestamp, ConvMode::TsInt64),
            (TargetType::Uint64, SqlType::Timestamp, ConvMode::TsUint64),
            (TargetType::Date32, SqlType::Timestamp, ConvMode::TsDate),
            (TargetType::Datetime64, SqlType::Date, ConvMode::Datetime),
            (TargetType::Text, SqlType::Date, ConvMode::DateText),
            (TargetType::Text, SqlType::Timestamp, ConvMode::TsText),
            (TargetType::Text, SqlType::Integer, ConvMode::Text),
            (TargetType::Bytes, SqlType::VarBinary, ConvMode::Bytes),
            (TargetType::Uuid, SqlType::Binary, ConvMode::UuidBinary),
            (TargetType::Uuid, SqlType::Char, ConvMode::UuidText),
        ];
        for (target, source, mode) in cases {
            assert_eq!(reader(target, source).mode, mode, "{} from {}", target, source);
        }
        assert_eq!(
            select_reader(TargetType::default_decimal(), SqlType::Numeric, false)
                .unwrap()
                .mode,
            ConvMode::DecimalText
        );
    }

    #[test]
    fn test_unsupported_combinations() {
        assert!(select_reader(TargetType::Date, SqlType::Integer, true).is_none());
        assert!(select_reader(TargetType::Timestamp, SqlType::VarChar, true).is_none());
        assert!(select_reader(TargetType::Uuid, SqlType::Integer, true).is_none());
        assert!(select_reader(TargetType::Bytes, SqlType::Date, true).is_none());
        assert!(select_reader(TargetType::Text, SqlType::VarBinary, true).is_none());
    }

    #[test]
    fn test_str2bool() {
        for falsy in ["", "  ", "N", "no", "0", "false", "F", "Нет", "ложь"] {
            assert!(!str2bool(falsy), "{:?}", falsy);
        }
        for truthy in ["Y", "yes", "1", "true", "Да", "x"] {
            assert!(str2bool(truthy), "{:?}", truthy);
        }
    }

    #[test]
    fn test_date_encodings() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(date2int(date), 20240307);
        let r = row(vec![date.into()]);
        assert_eq!(
            reader(TargetType::Int32, SqlType::Date).read(&r, 0, None).unwrap(),
            TargetValue::Int32(20240307)
        );
        assert_eq!(
            reader(TargetType::Text, SqlType::Date).read(&r, 0, None).unwrap(),
            TargetValue::Text("2024/03/07".into())
        );
    }

    #[test]
    fn test_time_and_timestamp_encodings() {
        let time = NaiveTime::from_hms_opt(1, 2, 3).unwrap();
        let r = row(vec![time.into()]);
        assert_eq!(
            reader(TargetType::Int32, SqlType::Time).read(&r, 0, None).unwrap(),
            TargetValue::Int32(3723)
        );

        let ts = NaiveDate::from_ymd_opt(1970, 1, 2)
            .unwrap()
            .and_hms_micro_opt(0, 0, 1, 250_000)
            .unwrap();
        let r = row(vec![ts.into()]);
        assert_eq!(
            reader(TargetType::Uint64, SqlType::Timestamp).read(&r, 0, None).unwrap(),
            TargetValue::Uint64(86_401_250)
        );
        assert_eq!(
            reader(TargetType::Datetime, SqlType::Timestamp).read(&r, 0, None).unwrap(),
            TargetValue::Datetime(ts.with_nanosecond(0).unwrap())
        );
        assert_eq!(
            reader(TargetType::Text, SqlType::Timestamp).read(&r, 0, None).unwrap(),
            TargetValue::Text("1970-01-02 00:00:01.250".into())
        );
    }

    #[test]
    fn test_negative_epoch_is_rejected_for_unsigned() {
        let ts = NaiveDate::from_ymd_opt(1969, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let r = row(vec![ts.into()]);
        assert!(reader(TargetType::Uint64, SqlType::Timestamp)
            .read(&r, 0, None)
            .is_err());
    }

    #[test]
    fn test_bool_sources() {
        let r = row(vec![SourceValue::Int(0), SourceValue::Int(5), "No".into(), "Yes".into()]);
        let int = reader(TargetType::Bool, SqlType::Integer);
        let text = reader(TargetType::Bool, SqlType::VarChar);
        assert_eq!(int.read(&r, 0, None).unwrap(), TargetValue::Bool(false));
        assert_eq!(int.read(&r, 1, None).unwrap(), TargetValue::Bool(true));
        assert_eq!(text.read(&r, 2, None).unwrap(), TargetValue::Bool(false));
        assert_eq!(text.read(&r, 3, None).unwrap(), TargetValue::Bool(true));
    }

    #[test]
    fn test_decimal_rounds_to_target_scale() {
        let r = row(vec![BigDecimal::from_str("12.3456").unwrap().into(), "7.125".into()]);
        let target = TargetType::Decimal {
            precision: 10,
            scale: 2,
        };
        let native = select_reader(target, SqlType::Numeric, true).unwrap();
        assert_eq!(
            native.read(&r, 0, None).unwrap(),
            TargetValue::Decimal(BigDecimal::from_str("12.35").unwrap())
        );
        let text = select_reader(target, SqlType::VarChar, false).unwrap();
        assert_eq!(text.mode, ConvMode::DecimalText);
        assert_eq!(
            text.read(&r, 1, None).unwrap(),
            TargetValue::Decimal(BigDecimal::from_str("7.12").unwrap())
        );
    }

    #[test]
    fn test_wide_decimal_keeps_every_digit() {
        let digits = "123456789012345678901234567890";
        let r = row(vec![BigDecimal::from_str(digits).unwrap().into(), digits.into()]);
        let target = TargetType::Decimal {
            precision: 35,
            scale: 0,
        };
        let expected = TargetValue::Decimal(BigDecimal::from_str(digits).unwrap());
        let native = select_reader(target, SqlType::Numeric, true).unwrap();
        assert_eq!(native.read(&r, 0, None).unwrap(), expected);
        let text = select_reader(target, SqlType::Numeric, false).unwrap();
        assert_eq!(text.read(&r, 1, None).unwrap(), expected);
    }

    #[test]
    fn test_decimal_beyond_precision_is_rejected() {
        let r = row(vec!["123456.7".into(), "99999.995".into()]);
        let rd = select_reader(
            TargetType::Decimal {
                precision: 7,
                scale: 2,
            },
            SqlType::VarChar,
            false,
        )
        .unwrap();
        assert!(rd.read(&r, 0, None).is_err());
        // rounding carries into a sixth integer digit
        assert!(rd.read(&r, 1, None).is_err());
    }

    #[test]
    fn test_null_yields_typed_absent_value_and_separator() {
        let r = row(vec![SourceValue::Null]);
        let rd = reader(TargetType::Int64, SqlType::BigInt);

        let mut with_null = SynthKey::new();
        assert_eq!(
            rd.read(&r, 0, Some(&mut with_null)).unwrap(),
            TargetValue::Null(TargetType::Int64)
        );
        let mut expected = SynthKey::new();
        expected.put_null();
        assert_eq!(with_null.build(), expected.build());
    }

    #[test]
    fn test_key_receives_native_encoding() {
        let r = row(vec![SourceValue::Int(42)]);
        let mut key = SynthKey::new();
        reader(TargetType::Int32, SqlType::Integer)
            .read(&r, 0, Some(&mut key))
            .unwrap();
        let mut expected = SynthKey::new();
        expected.put_i32(42);
        assert_eq!(key.build(), expected.build());
    }

    #[test]
    fn test_out_of_range_unsigned() {
        let r = row(vec![SourceValue::Int(-1)]);
        assert!(reader(TargetType::Uint32, SqlType::Integer)
            .read(&r, 0, None)
            .is_err());
    }

    #[test]
    fn test_uuid_from_text_and_bytes() {
        let id = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
        let r = row(vec![id.to_string().into(), id.as_bytes().to_vec().into()]);
        assert_eq!(
            reader(TargetType::Uuid, SqlType::Char).read(&r, 0, None).unwrap(),
            TargetValue::Uuid(id)
        );
        assert_eq!(
            reader(TargetType::Uuid, SqlType::Binary).read(&r, 1, None).unwrap(),
            TargetValue::Uuid(id)
        );
    }
}
