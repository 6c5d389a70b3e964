// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;

use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::string_data::StringData;
use crate::{DecodePacket, EncodePacket};

/// A concrete topic name as carried in a PUBLISH packet.
///
/// Publish topics MUST NOT contain the `+`/`#` wildcard characters and MUST NOT be
/// empty [MQTT-4.7.3-1].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PubTopic(StringData);

impl PubTopic {
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains a wildcard character.
    pub fn new(topic: &str) -> Result<Self, EncodeError> {
        validate_pub_topic(topic)?;
        Ok(Self(StringData::from(topic)?))
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.0.bytes()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        validate_pub_topic(s.as_ref()).map_err(|_err| DecodeError::InvalidTopic)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.0.encode(v)
    }
}

/// A topic filter as carried in SUBSCRIBE/UNSUBSCRIBE, which may contain the `+`
/// (single-level) and `#` (multi-level, trailing only) wildcard characters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubTopic(StringData);

impl SubTopic {
    /// # Errors
    ///
    /// Returns error if `topic` is empty or uses a wildcard character incorrectly.
    pub fn new(topic: &str) -> Result<Self, EncodeError> {
        validate_sub_topic(topic)?;
        Ok(Self(StringData::from(topic)?))
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.0.bytes()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        validate_sub_topic(s.as_ref()).map_err(|_err| DecodeError::InvalidTopic)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.0.encode(v)
    }
}

fn validate_pub_topic(topic: &str) -> Result<(), EncodeError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        Err(EncodeError::InvalidTopic)
    } else {
        Ok(())
    }
}

fn validate_sub_topic(topic: &str) -> Result<(), EncodeError> {
    if topic.is_empty() {
        return Err(EncodeError::InvalidTopic);
    }
    for (idx, level) in topic.split('/').enumerate() {
        if level == "#" {
            // '#' MUST only appear as the last level of the filter [MQTT-4.7.1-2].
            if idx != topic.split('/').count() - 1 {
                return Err(EncodeError::InvalidTopic);
            }
        } else if level.contains('#') {
            return Err(EncodeError::InvalidTopic);
        } else if level != "+" && level.contains('+') {
            // '+' MUST occupy an entire level [MQTT-4.7.1-3].
            return Err(EncodeError::InvalidTopic);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("a/b").is_ok());
        assert!(PubTopic::new("a/+/c").is_err());
        assert!(PubTopic::new("a/#").is_err());
        assert!(PubTopic::new("").is_err());
    }

    #[test]
    fn test_sub_topic_wildcards() {
        assert!(SubTopic::new("a/+/c").is_ok());
        assert!(SubTopic::new("a/#").is_ok());
        assert!(SubTopic::new("a/b#").is_err());
        assert!(SubTopic::new("a/#/c").is_err());
    }
}
