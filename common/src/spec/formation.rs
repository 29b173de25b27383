/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};

/// Named logical deployment. The attribute bag is opaque to the
/// control plane and carried verbatim for API consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formation {
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}
