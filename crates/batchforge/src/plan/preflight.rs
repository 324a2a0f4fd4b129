// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-flight checks shared by every plan.
//!
//! Both checks record what they learn in [`RunState`](super::RunState) and
//! skip themselves when a previous plan of the same invocation already ran
//! them.

use async_trait::async_trait;
use serde_json::Value;

use super::{Precondition, StepAction, StepContext};
use crate::error::{Error, Result};
use crate::executor::CloudCommand;
use crate::log::Level;

/// `az version`: the CLI is installed and runnable.
pub struct PreflightCli;

#[async_trait]
impl StepAction for PreflightCli {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        Ok(match &cx.state.cli_version {
            Some(version) => Precondition::skip(format!("az {} already verified", version)),
            None => Precondition::Run,
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let command = CloudCommand::new("Check Azure CLI", ["version"]).json();
        let version = cx
            .run_json(&command)
            .await
            .map_err(|e| Error::Precondition(format!("Azure CLI is not available: {}", e)))?;
        let version = version
            .get("azure-cli")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        cx.note(Level::Info, format!("Azure CLI {}", version));
        cx.state.cli_version = Some(version);
        Ok(())
    }
}

/// `az account show`: the CLI is signed in; records the subscription.
pub struct PreflightLogin;

#[async_trait]
impl StepAction for PreflightLogin {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        Ok(match &cx.state.subscription_id {
            Some(id) => Precondition::skip(format!("signed in to subscription {}", id)),
            None => Precondition::Run,
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let command = CloudCommand::new("Check Azure login", ["account", "show"]).json();
        let account = cx.run_json(&command).await.map_err(|e| {
            Error::Precondition(format!("not signed in to Azure (run 'az login'): {}", e))
        })?;
        let id = account
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Precondition("'az account show' returned no subscription id".into()))?
            .to_string();
        let name = account.get("name").and_then(Value::as_str).unwrap_or("");
        cx.note(Level::Info, format!("Using subscription {} ({})", id, name));
        cx.state.subscription_id = Some(id);
        Ok(())
    }
}
