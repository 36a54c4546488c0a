use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Watermarks carried across runs: a single timestamp for the units listing
/// and one per unit for its attempts. Both only ever move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default = "epoch", with = "time::serde::rfc3339")]
    pub units_last_ts: OffsetDateTime,
    #[serde(default, with = "rfc3339_map")]
    pub attempts_last_ts: BTreeMap<String, OffsetDateTime>,
}

fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            units_last_ts: epoch(),
            attempts_last_ts: BTreeMap::new(),
        }
    }
}

impl SyncState {
    pub fn units_watermark(&self) -> OffsetDateTime {
        self.units_last_ts
    }

    pub fn attempts_watermark(&self, unit_id: &str) -> OffsetDateTime {
        self.attempts_last_ts
            .get(unit_id)
            .copied()
            .unwrap_or_else(epoch)
    }

    pub fn advance_units(&mut self, ts: OffsetDateTime) {
        if ts > self.units_last_ts {
            self.units_last_ts = ts;
        }
    }

    /// Materializes the unit's entry even when the timestamp does not move,
    /// so every enumerated unit has a recorded watermark.
    pub fn advance_attempts(&mut self, unit_id: &str, ts: OffsetDateTime) {
        let entry = self
            .attempts_last_ts
            .entry(unit_id.to_string())
            .or_insert_with(epoch);
        if ts > *entry {
            *entry = ts;
        }
    }
}

mod rfc3339_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::{Error as _, SerializeMap};
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    pub fn serialize<S>(
        map: &BTreeMap<String, OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (unit_id, ts) in map {
            let value = ts.format(&Rfc3339).map_err(S::Error::custom)?;
            out.serialize_entry(unit_id, &value)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<String, OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(unit_id, value)| {
                OffsetDateTime::parse(&value, &Rfc3339)
                    .map(|ts| (unit_id, ts))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn default_starts_at_epoch() {
        let state = SyncState::default();
        assert_eq!(state.units_watermark(), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(state.attempts_watermark("u-1"), OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn advance_units_never_regresses() {
        let mut state = SyncState::default();
        state.advance_units(datetime!(2024-03-02 09:30:00 UTC));
        state.advance_units(datetime!(2024-03-01 10:00:00 UTC));
        assert_eq!(state.units_watermark(), datetime!(2024-03-02 09:30:00 UTC));
    }

    #[test]
    fn advance_attempts_tracks_per_unit() {
        let mut state = SyncState::default();
        state.advance_attempts("u-1", datetime!(2024-03-02 09:30:00 UTC));
        state.advance_attempts("u-2", datetime!(2024-03-03 09:30:00 UTC));
        state.advance_attempts("u-1", datetime!(2024-03-01 10:00:00 UTC));

        assert_eq!(
            state.attempts_watermark("u-1"),
            datetime!(2024-03-02 09:30:00 UTC)
        );
        assert_eq!(
            state.attempts_watermark("u-2"),
            datetime!(2024-03-03 09:30:00 UTC)
        );
    }

    #[test]
    fn advance_attempts_materializes_entry_at_epoch() {
        let mut state = SyncState::default();
        state.advance_attempts("u-1", OffsetDateTime::UNIX_EPOCH);
        assert!(state.attempts_last_ts.contains_key("u-1"));
        assert_eq!(state.attempts_watermark("u-1"), OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn serde_round_trips_rfc3339() {
        let mut state = SyncState::default();
        state.advance_units(datetime!(2024-03-01 10:00:00 UTC));
        state.advance_attempts("u-1", datetime!(2024-03-02 09:30:00 UTC));

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(raw["units_last_ts"], "2024-03-01T10:00:00Z");
        assert_eq!(raw["attempts_last_ts"]["u-1"], "2024-03-02T09:30:00Z");

        let restored: SyncState = serde_json::from_value(raw).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let restored: SyncState = serde_json::from_str("{}").unwrap();
        assert_eq!(restored, SyncState::default());
    }
}
