// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::EncodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    InvalidUtf8,
    TooManyData,
}

impl From<StringError> for EncodeError {
    fn from(_e: StringError) -> Self {
        Self::TooManyData
    }
}

/// Convert raw bytes read off the wire into a `String`.
///
/// # Errors
///
/// Returns error if `buf` is not valid UTF-8.
pub fn to_utf8_string(buf: &[u8]) -> Result<String, StringError> {
    String::from_utf8(buf.to_vec()).map_err(|_err| StringError::InvalidUtf8)
}

/// Validate that `s` is a well-formed, length-limited MQTT UTF-8 string.
///
/// # Errors
///
/// Returns error if `s` is longer than 65535 bytes. All Rust `&str` values are
/// already valid UTF-8, so only the length bound is checked here.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        Err(StringError::TooManyData)
    } else {
        Ok(())
    }
}

/// Validate that binary `data` fits the two-byte length prefix used for Binary Data.
///
/// # Errors
///
/// Returns error if `data` is longer than 65535 bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        Err(EncodeError::TooManyData)
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub enum ClientIdError {
    IsEmpty,
    TooLong,
    InvalidChars,
}

/// Validate a `client_id` against the classic MQTT 3.1.1 charset and length rules.
///
/// A zero-length id is accepted here; the CONNECT packet itself rejects it unless
/// `clean_session` is set.
///
/// # Errors
///
/// Returns error if the id is longer than 23 bytes or contains characters outside
/// `[0-9a-zA-Z]`.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if !client_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Generate a random alphanumeric client id, used when the caller leaves one unset.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}
