//! Query-string handling shared by the HTTP handlers. Parameters arrive as
//! raw pairs so repeatable keys survive; list-valued keys also split on
//! commas.

use fleetd_core::VehicleId;

use super::error::ApiError;

pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeatable, comma-splittable key, trimmed and
    /// de-blanked.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        self.list("vehicleId")
            .into_iter()
            .map(VehicleId::new)
            .collect()
    }

    /// Optional [start, end) instants. `durationSeconds` fills in a missing
    /// start relative to end (or now). Rejects start >= end and
    /// unparseable instants.
    pub fn time_range(
        &self,
    ) -> Result<(Option<jiff::Timestamp>, Option<jiff::Timestamp>), ApiError> {
        let start = self.first("start").map(parse_instant).transpose()?;
        let end = self.first("end").map(parse_instant).transpose()?;

        let start = match (start, self.parse_u64("durationSeconds")?) {
            (Some(start), _) => Some(start),
            (None, Some(duration)) => {
                let anchor = end.unwrap_or_else(jiff::Timestamp::now);
                let ms = anchor.as_millisecond() - (duration as i64) * 1000;
                Some(jiff::Timestamp::from_millisecond(ms).map_err(|e| {
                    ApiError::InvalidArgument(format!("durationSeconds out of range: {e}"))
                })?)
            }
            (None, None) => None,
        };

        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return Err(ApiError::InvalidArgument(
                    "start must be earlier than end".to_owned(),
                ));
            }
        }

        Ok((start, end))
    }

    pub fn parse_u32(&self, key: &str) -> Result<Option<u32>, ApiError> {
        self.first(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| ApiError::InvalidArgument(format!("invalid {key}: {v}")))
            })
            .transpose()
    }

    pub fn parse_u64(&self, key: &str) -> Result<Option<u64>, ApiError> {
        self.first(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| ApiError::InvalidArgument(format!("invalid {key}: {v}")))
            })
            .transpose()
    }

    pub fn parse_i64(&self, key: &str) -> Result<Option<i64>, ApiError> {
        self.first(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| ApiError::InvalidArgument(format!("invalid {key}: {v}")))
            })
            .transpose()
    }
}

pub fn parse_instant(value: &str) -> Result<jiff::Timestamp, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::InvalidArgument(format!("unparseable instant: {value}")))
}

/// The metric names accepted by the `aggregate` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateField {
    AvgSpeed,
    MaxSpeed,
    MinFuel,
    TotalDistance,
    SampleCount,
}

impl AggregateField {
    pub const ALL: [AggregateField; 5] = [
        AggregateField::AvgSpeed,
        AggregateField::MaxSpeed,
        AggregateField::MinFuel,
        AggregateField::TotalDistance,
        AggregateField::SampleCount,
    ];

    pub fn parse(value: &str) -> Result<Self, ApiError> {
        match value {
            "avgSpeed" => Ok(AggregateField::AvgSpeed),
            "maxSpeed" => Ok(AggregateField::MaxSpeed),
            "minFuel" => Ok(AggregateField::MinFuel),
            "totalDistance" => Ok(AggregateField::TotalDistance),
            "sampleCount" => Ok(AggregateField::SampleCount),
            other => Err(ApiError::InvalidArgument(format!("unknown aggregate: {other}"))),
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            AggregateField::AvgSpeed => "avgSpeed",
            AggregateField::MaxSpeed => "maxSpeed",
            AggregateField::MinFuel => "minFuel",
            AggregateField::TotalDistance => "totalDistance",
            AggregateField::SampleCount => "sampleCount",
        }
    }
}

/// Selected aggregate fields, or all of them when none were named.
pub fn aggregate_selection(params: &QueryParams) -> Result<Vec<AggregateField>, ApiError> {
    let named = params.list("aggregate");
    if named.is_empty() {
        return Ok(AggregateField::ALL.to_vec());
    }
    named.iter().map(|v| AggregateField::parse(v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        QueryParams::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn vehicle_ids_are_repeatable_and_comma_splittable() {
        let p = params(&[("vehicleId", "veh-1,veh-2"), ("vehicleId", " veh-3 ")]);
        let ids: Vec<String> = p.vehicle_ids().iter().map(|v| v.to_string()).collect();
        assert_eq!(ids, ["veh-1", "veh-2", "veh-3"]);
    }

    #[test]
    fn start_after_end_is_rejected() {
        let p = params(&[
            ("start", "2024-01-02T00:00:00Z"),
            ("end", "2024-01-01T00:00:00Z"),
        ]);
        assert!(matches!(p.time_range(), Err(ApiError::InvalidArgument(_))));
    }

    #[test]
    fn equal_endpoints_are_rejected() {
        let p = params(&[
            ("start", "2024-01-01T00:00:00Z"),
            ("end", "2024-01-01T00:00:00Z"),
        ]);
        assert!(matches!(p.time_range(), Err(ApiError::InvalidArgument(_))));
    }

    #[test]
    fn garbage_instants_are_rejected() {
        let p = params(&[("start", "lunchtime")]);
        assert!(matches!(p.time_range(), Err(ApiError::InvalidArgument(_))));
    }

    #[test]
    fn duration_fills_in_the_start() {
        let p = params(&[("end", "2024-01-01T01:00:00Z"), ("durationSeconds", "3600")]);
        let (start, end) = p.time_range().unwrap();
        assert_eq!(start.unwrap(), "2024-01-01T00:00:00Z".parse().unwrap());
        assert_eq!(end.unwrap(), "2024-01-01T01:00:00Z".parse().unwrap());
    }

    #[test]
    fn aggregate_selection_defaults_to_all() {
        let p = params(&[]);
        assert_eq!(aggregate_selection(&p).unwrap().len(), 5);

        let p = params(&[("aggregate", "avgSpeed,maxSpeed")]);
        assert_eq!(
            aggregate_selection(&p).unwrap(),
            vec![AggregateField::AvgSpeed, AggregateField::MaxSpeed]
        );

        let p = params(&[("aggregate", "median")]);
        assert!(aggregate_selection(&p).is_err());
    }
}
