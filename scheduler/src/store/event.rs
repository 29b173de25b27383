/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use common::spec::Instance;

/// Change notification emitted by the instance store as the watch
/// stream is applied to the in-memory mirror.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Created(Instance),
    Updated(Instance),
    Deleted(Instance),
}

impl StoreEvent {
    pub fn instance(&self) -> &Instance {
        match self {
            StoreEvent::Created(inst) | StoreEvent::Updated(inst) | StoreEvent::Deleted(inst) => {
                inst
            }
        }
    }
}
