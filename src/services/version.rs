use chrono::{NaiveDate, Utc};

/// Derive the next version string when the caller did not pass one.
pub fn next_version(prior: Option<&str>) -> String {
    next_version_on(prior, Utc::now().date_naive())
}

/// Rules, in order: no prior version gives `YYYYMMDD01` (UTC); a prior
/// version for the same day increments its counter; a prior version ending
/// in two digits increments those; anything else gets `1` appended.
pub fn next_version_on(prior: Option<&str>, today: NaiveDate) -> String {
    let stamp = today.format("%Y%m%d").to_string();
    let Some(prior) = prior else {
        return format!("{stamp}01");
    };

    if prior.len() == 10
        && prior.starts_with(&stamp)
        && prior[8..].chars().all(|c| c.is_ascii_digit())
    {
        let counter: u32 = prior[8..].parse().unwrap_or(0);
        return format!("{stamp}{:02}", counter + 1);
    }

    if prior.is_ascii() && prior.len() >= 2 {
        let (head, tail) = prior.split_at(prior.len() - 2);
        if tail.chars().all(|c| c.is_ascii_digit()) {
            let counter: u32 = tail.parse().unwrap_or(0);
            return format!("{head}{:02}", counter + 1);
        }
    }

    format!("{prior}1")
}
