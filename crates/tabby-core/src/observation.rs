use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use thiserror::Error;

/// Field separator used by snapshot rows.
pub const DELIMITER: char = ',';

/// Glyph the archive prints in the error column when no uncertainty was reported.
pub const UNKNOWN_UNCERTAINTY: &str = "\u{2014}";

/// Number of fields in a raw row and in a snapshot row.
pub const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObservationField {
    Timestamp,
    CalendarLabel,
    Magnitude,
    Uncertainty,
    Band,
    ObserverId,
}

impl fmt::Display for ObservationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timestamp => "timestamp",
            Self::CalendarLabel => "calendar label",
            Self::Magnitude => "magnitude",
            Self::Uncertainty => "uncertainty",
            Self::Band => "band",
            Self::ObserverId => "observer id",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{field} is not a valid number: {raw:?}")]
    InvalidNumber { field: ObservationField, raw: String },
    #[error("{field} is not finite: {raw:?}")]
    NonFinite { field: ObservationField, raw: String },
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),
    #[error("{field} contains the snapshot delimiter")]
    Delimiter { field: ObservationField },
}

/// One brightness measurement as reported by the archive.
///
/// Identity is `(timestamp, observer_id)`: two observations with the same
/// pair are the same logical record even if magnitude, band or formatting
/// differ between scrapes. The ordering sorts newest first, breaking
/// timestamp ties by observer id ascending, and agrees with equality.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    timestamp: f64,
    calendar_label: String,
    magnitude: f64,
    uncertainty: f64,
    band: String,
    observer_id: String,
}

impl Observation {
    /// Build an observation from six raw text fields.
    ///
    /// Text fields are trimmed. An uncertainty equal to
    /// [`UNKNOWN_UNCERTAINTY`] becomes `0.0`. Numeric fields must parse to a
    /// finite `f64`.
    pub fn new(
        raw_timestamp: &str,
        raw_calendar_label: &str,
        raw_magnitude: &str,
        raw_uncertainty: &str,
        raw_band: &str,
        raw_observer_id: &str,
    ) -> Result<Self, ParseError> {
        let timestamp = parse_finite(ObservationField::Timestamp, raw_timestamp)?;
        let magnitude = parse_finite(ObservationField::Magnitude, raw_magnitude)?;
        let uncertainty = if raw_uncertainty.trim() == UNKNOWN_UNCERTAINTY {
            0.0
        } else {
            parse_finite(ObservationField::Uncertainty, raw_uncertainty)?
        };

        Ok(Self {
            timestamp,
            calendar_label: clean_text(ObservationField::CalendarLabel, raw_calendar_label)?,
            magnitude,
            uncertainty,
            band: clean_text(ObservationField::Band, raw_band)?,
            observer_id: clean_text(ObservationField::ObserverId, raw_observer_id)?,
        })
    }

    /// Build from exactly [`FIELD_COUNT`] fields in snapshot order.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self, ParseError> {
        let [timestamp, label, magnitude, uncertainty, band, observer] = fields else {
            return Err(ParseError::FieldCount(fields.len()));
        };
        Self::new(
            timestamp.as_ref(),
            label.as_ref(),
            magnitude.as_ref(),
            uncertainty.as_ref(),
            band.as_ref(),
            observer.as_ref(),
        )
    }

    /// Parse one snapshot row as produced by [`Observation::to_row`].
    pub fn from_row(row: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = row
            .trim_end_matches(['\r', '\n'])
            .split(DELIMITER)
            .collect();
        Self::from_fields(&fields)
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn calendar_label(&self) -> &str {
        &self.calendar_label
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn uncertainty(&self) -> f64 {
        self.uncertainty
    }

    pub fn band(&self) -> &str {
        &self.band
    }

    pub fn observer_id(&self) -> &str {
        &self.observer_id
    }

    /// Serialize as a snapshot row without the trailing newline.
    ///
    /// Numbers use the shortest representation that parses back to the same
    /// `f64`, so no precision is lost.
    pub fn to_row(&self) -> String {
        format!(
            "{:?}{d}{}{d}{:?}{d}{:?}{d}{}{d}{}",
            self.timestamp,
            self.calendar_label,
            self.magnitude,
            self.uncertainty,
            self.band,
            self.observer_id,
            d = DELIMITER,
        )
    }
}

fn parse_finite(field: ObservationField, raw: &str) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    let value: f64 = trimmed.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })?;
    if !value.is_finite() {
        return Err(ParseError::NonFinite {
            field,
            raw: raw.to_string(),
        });
    }
    // -0.0 and 0.0 must be the same timestamp for both Eq and Ord.
    Ok(if value == 0.0 { 0.0 } else { value })
}

fn clean_text(field: ObservationField, raw: &str) -> Result<String, ParseError> {
    let trimmed = raw.trim();
    if trimmed.contains(DELIMITER) {
        return Err(ParseError::Delimiter { field });
    }
    Ok(trimmed.to_string())
}

impl PartialEq for Observation {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.observer_id == other.observer_id
    }
}

impl Eq for Observation {}

impl Hash for Observation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.timestamp.to_bits().hash(state);
        self.observer_id.hash(state);
    }
}

impl Ord for Observation {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .total_cmp(&self.timestamp)
            .then_with(|| self.observer_id.cmp(&other.observer_id))
    }
}

impl PartialOrd for Observation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(timestamp: &str, observer: &str, magnitude: &str) -> Observation {
        Observation::new(timestamp, "2017 May. 18.5", magnitude, "0.01", "V", observer)
            .expect("valid observation")
    }

    #[test]
    fn trims_text_fields() {
        let o = Observation::new(
            " 2457890.12345 ",
            "  2017 May. 18.62345 \n",
            "11.92",
            "0.004",
            " V ",
            "\tLDJ\n",
        )
        .expect("observation");
        assert_eq!(o.calendar_label(), "2017 May. 18.62345");
        assert_eq!(o.band(), "V");
        assert_eq!(o.observer_id(), "LDJ");
        assert_eq!(o.timestamp(), 2457890.12345);
    }

    #[test]
    fn unknown_uncertainty_glyph_becomes_zero() {
        let o = Observation::new("2457890.1", "label", "11.9", "\u{2014}", "Vis.", "XYZ")
            .expect("observation");
        assert_eq!(o.uncertainty(), 0.0);

        let padded = Observation::new("2457890.1", "label", "11.9", " \u{2014} ", "Vis.", "XYZ")
            .expect("observation");
        assert_eq!(padded.uncertainty(), 0.0);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = Observation::new("not-a-date", "l", "11.9", "0.1", "V", "A").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                field: ObservationField::Timestamp,
                raw: "not-a-date".into()
            }
        );

        let err = Observation::new("2457890.1", "l", "<12.5", "0.1", "V", "A").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber { field: ObservationField::Magnitude, .. }
        ));

        let err = Observation::new("2457890.1", "l", "12.5", "", "V", "A").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber { field: ObservationField::Uncertainty, .. }
        ));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        for raw in ["NaN", "inf", "-infinity"] {
            let err = Observation::new(raw, "l", "11.9", "0.1", "V", "A").unwrap_err();
            assert!(matches!(err, ParseError::NonFinite { .. }), "{raw}");
        }
    }

    #[test]
    fn delimiter_in_text_field_is_rejected() {
        let err = Observation::new("2457890.1", "May 1, 2017", "11.9", "0.1", "V", "A").unwrap_err();
        assert_eq!(
            err,
            ParseError::Delimiter {
                field: ObservationField::CalendarLabel
            }
        );
    }

    #[test]
    fn equality_ignores_non_identity_fields() {
        let a = Observation::new("2457890.1", "one", "11.9", "0.1", "V", "ABC").unwrap();
        let b = Observation::new("2457890.1", "two", "12.4", "\u{2014}", "B", "ABC").unwrap();
        let c = Observation::new("2457890.1", "one", "11.9", "0.1", "V", "ABD").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_descending_time_then_ascending_observer() {
        let mut items = vec![
            obs("100", "B", "1"),
            obs("105", "Z", "1"),
            obs("100", "A", "1"),
            obs("99.5", "A", "1"),
        ];
        items.sort();
        let keys: Vec<_> = items
            .iter()
            .map(|o| (o.timestamp(), o.observer_id().to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (105.0, "Z".to_string()),
                (100.0, "A".to_string()),
                (100.0, "B".to_string()),
                (99.5, "A".to_string()),
            ]
        );
    }

    #[test]
    fn ordering_is_total_and_antisymmetric() {
        let items = [
            obs("100", "A", "1"),
            obs("100", "B", "1"),
            obs("101", "A", "1"),
            obs("0", "A", "1"),
            obs("-0.0", "B", "1"),
        ];
        for a in &items {
            assert_eq!(a.cmp(a), Ordering::Equal);
            for b in &items {
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                assert_eq!(a.cmp(b) == Ordering::Equal, a == b);
            }
        }
    }

    #[test]
    fn negative_zero_is_normalized() {
        let a = obs("-0.0", "A", "1");
        let b = obs("0", "A", "1");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert!(a.timestamp().is_sign_positive());
    }

    #[test]
    fn row_round_trip_preserves_precision() {
        let o = Observation::new(
            "2457890.1234567",
            "2017 May. 18.623457",
            "11.923456789012",
            "\u{2014}",
            "TG",
            "OAR",
        )
        .unwrap();
        let row = o.to_row();
        assert_eq!(row, "2457890.1234567,2017 May. 18.623457,11.923456789012,0.0,TG,OAR");

        let back = Observation::from_row(&row).unwrap();
        assert_eq!(back, o);
        assert_eq!(back.magnitude(), o.magnitude());
        assert_eq!(back.band(), o.band());
        assert_eq!(back.calendar_label(), o.calendar_label());
        assert_eq!(back.uncertainty(), 0.0);
    }

    #[test]
    fn from_row_accepts_trailing_newline_and_checks_field_count() {
        let o = Observation::from_row("2457890.5,label,12.0,0.02,V,ABC\r\n").unwrap();
        assert_eq!(o.observer_id(), "ABC");

        let err = Observation::from_row("2457890.5,label,12.0,0.02,V").unwrap_err();
        assert_eq!(err, ParseError::FieldCount(5));
    }
}
