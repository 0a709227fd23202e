//! Record validation

use super::clean::CleanedRecord;
use super::RejectReason;

/// A cleaned record is valid when its URL points at the expected host and
/// its primary counters are usable
pub fn validate_record(record: &CleanedRecord, expected_host: &str) -> Result<(), RejectReason> {
    let host = url::Url::parse(&record.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .ok_or(RejectReason::InvalidUrl)?;

    if !host.contains(&expected_host.to_ascii_lowercase()) {
        return Err(RejectReason::UnexpectedHost(host));
    }

    if [record.views, record.likes, record.comments]
        .iter()
        .any(|c| *c < 0)
    {
        return Err(RejectReason::InvalidCounters);
    }

    Ok(())
}
