use crate::{
    domain::PowerSample,
    pipeline::{CollectorError, Envelope, Transform},
};
use time::macros::datetime;

/// Pure validation of a `PowerSample`.
///
/// Rules:
/// - watts must be non-negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_power_sample(
    env: Envelope<PowerSample>,
) -> Result<Envelope<PowerSample>, CollectorError> {
    let s = &env.payload;

    if s.watts < 0.0 {
        return Err(CollectorError::MalformedResponse(format!(
            "negative power {} W at {}",
            s.watts, s.ts
        )));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if s.ts < min_ts || s.ts > max_ts {
        return Err(CollectorError::MalformedResponse(format!(
            "timestamp {} outside allowed range",
            s.ts
        )));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct PowerSampleValidation;

#[async_trait::async_trait]
impl Transform<PowerSample> for PowerSampleValidation {
    async fn apply(
        &self,
        input: Envelope<PowerSample>,
    ) -> Result<Envelope<PowerSample>, CollectorError> {
        match validate_power_sample(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_power_sample_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
