/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = common::setting::get_config();
    scheduler::util::logging::init_logging(&settings.log_level)?;

    info!(
        formation = %settings.formation,
        database = %settings.database,
        "starting scheduler"
    );
    scheduler::manager::run().await
}
