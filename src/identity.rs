/* distrans - a lightweight relay fanning out conversion events to marketing APIs
 * Copyright (C) 2023 Withings
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>. */

//! Hashing and normalisation of personally identifying fields

use std::ops::RangeInclusive;
use sha2::{Digest, Sha256};

/// Default country code for phone numbers (Brazil)
pub const DEFAULT_COUNTRY_CODE: &str = "55";

/// Hashes a PII value: trimmed, lowercased, SHA-256, lowercase hex
pub fn hash(value: &str) -> String {
    let normalised = value.trim().to_lowercase();
    hex::encode(Sha256::digest(normalised.as_bytes()))
}

/// Describes what a valid phone number looks like for a given country
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneFormat {
    /// Country calling code, digits only
    pub country_code: String,
    /// Accepted digit counts for a national number (without trunk prefix)
    pub national_lengths: RangeInclusive<usize>,
}

impl PhoneFormat {
    /// Builds a format for a country code, using Brazilian-style national lengths
    pub fn for_country(country_code: &str) -> Self {
        Self {
            country_code: country_code.chars().filter(|c| c.is_ascii_digit()).collect(),
            national_lengths: 10..=11,
        }
    }

    /// Canonicalises a free-form phone number into `+<country><national>`
    ///
    /// Returns None when the number cannot be normalised for this country,
    /// this is not considered an error.
    pub fn normalize(&self, raw: Option<&str>) -> Option<String> {
        let raw = raw?;
        let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.starts_with('0') {
            digits.remove(0);
        }

        let length = digits.len();
        if self.national_lengths.contains(&length) {
            digits.insert_str(0, &self.country_code);
        } else if length >= self.country_code.len()
            && self.national_lengths.contains(&(length - self.country_code.len()))
            && digits.starts_with(&self.country_code) {
            /* already carries the country code */
        } else {
            return None;
        }

        Some(format!("+{}", digits))
    }
}

impl Default for PhoneFormat {
    fn default() -> Self {
        Self::for_country(DEFAULT_COUNTRY_CODE)
    }
}

/// Strips the leading "+" from a normalised phone number
pub fn digits_only(normalised: &str) -> &str {
    normalised.trim_start_matches('+')
}


#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_phone(raw: Option<&str>) -> Option<String> {
        PhoneFormat::default().normalize(raw)
    }

    #[test]
    fn hash_is_case_and_whitespace_insensitive() {
        assert_eq!(hash("Test@Example.com "), hash("test@example.com"));
        assert_eq!(hash("  MiXeD  "), hash("mixed"));
    }

    #[test]
    fn hash_is_lowercase_sha256_hex() {
        assert_eq!(
            hash("test@example.com"),
            "973dfe463ec85785f5f95af5ba3906eedb2d931c24e69824a89ea65dba4e813b"
        );
    }

    #[test]
    fn trunk_prefix_is_dropped_and_country_code_added() {
        assert_eq!(normalize_phone(Some("011987654321")), Some("+5511987654321".into()));
        assert_eq!(normalize_phone(Some("(11) 98765-4321")), Some("+5511987654321".into()));
        assert_eq!(normalize_phone(Some("11 8765-4321")), Some("+551187654321".into()));
    }

    #[test]
    fn numbers_with_country_code_are_kept() {
        assert_eq!(normalize_phone(Some("+55 11 98765-4321")), Some("+5511987654321".into()));
        assert_eq!(normalize_phone(Some("551187654321")), Some("+551187654321".into()));
    }

    #[test]
    fn invalid_lengths_are_rejected() {
        assert_eq!(normalize_phone(Some("987654321")), None);
        assert_eq!(normalize_phone(Some("12345678901234")), None);
        assert_eq!(normalize_phone(Some("441187654321")), None);
        assert_eq!(normalize_phone(Some("")), None);
        assert_eq!(normalize_phone(None), None);
    }

    #[test]
    fn normalisation_is_idempotent() {
        for raw in ["011987654321", "11 8765-4321", "+55 (11) 98765-4321"] {
            let once = normalize_phone(Some(raw)).unwrap();
            let twice = normalize_phone(Some(digits_only(&once))).unwrap();
            assert_eq!(once, twice);
            assert_eq!(normalize_phone(Some(&once)), Some(once.clone()));
        }
    }

    #[test]
    fn other_countries_use_their_code() {
        let format = PhoneFormat::for_country("+33");
        assert_eq!(format.country_code, "33");
        assert_eq!(format.normalize(Some("0612345678")), None);
        assert_eq!(format.normalize(Some("3361234567890")), Some("+3361234567890".into()));
    }
}
