/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Widely-shared type definitions for the record scheduler.

use std::fmt;
use std::str::FromStr;

use nix::errno;
use nix::sys::signal::Signal;
use serde::de;
use serde::Serialize;
use serde::Serializer;

pub mod config;
pub mod pid;
pub mod summary;
pub mod task;

/// Simply a type to hang Serialize/Deserialize instances off of.
#[derive(PartialEq, Debug, Eq, Clone, Copy, Hash)]
pub struct SigWrapper(pub Signal);

impl fmt::Display for SigWrapper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for SigWrapper {
    type Err = errno::Errno;

    /// Accepts both `SIGINT` and the short `INT` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Signal::from_str(&name).map(SigWrapper)
    }
}

impl Serialize for SigWrapper {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> de::Deserialize<'de> for SigWrapper {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct SignalVisitor;
        impl<'de> de::Visitor<'de> for SignalVisitor {
            type Value = SigWrapper;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "string representing a Signal")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                SigWrapper::from_str(v).map_err(|e| de::Error::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(SignalVisitor)
    }
}
