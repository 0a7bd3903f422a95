//! Proxy failover: take the failed proxy out of every name service

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::context::HaContext;

use super::{BaseSwitch, DataBaseSwitch, SwitchError};

pub struct ProxySwitch {
    base: BaseSwitch,
    ctx: Arc<HaContext>,
}

impl ProxySwitch {
    pub fn new(base: BaseSwitch, ctx: Arc<HaContext>) -> Self {
        Self { base, ctx }
    }
}

#[async_trait]
impl DataBaseSwitch for ProxySwitch {
    async fn check_switch(&mut self) -> Result<bool, SwitchError> {
        if self.base.extra.binds.is_empty() {
            self.base
                .report_logs("info", "no name-service binding points at this proxy")
                .await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn do_switch(&mut self) -> Result<(), SwitchError> {
        let call_timeout = self.ctx.config.switch.name_service_timeout();
        self.base
            .release_name_service(&self.ctx.name_services, call_timeout)
            .await?;
        info!(addr = %self.base.addr(), "Proxy removed from name services");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SwitchError> {
        let call_timeout = self.ctx.config.switch.name_service_timeout();
        self.base
            .restore_released(&self.ctx.name_services, call_timeout)
            .await
    }

    fn base(&self) -> &BaseSwitch {
        &self.base
    }
}
