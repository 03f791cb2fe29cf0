//! The ordered stage table a pass walks through.
//!
//! Order is data: later stages read state written by earlier ones (the
//! ingress stage sees paths already claimed by gateway routes), so the table
//! is the single place that order is decided.

use crate::converter::{Converter, PassContext};
use crate::converters::{gateway, ingress, tcp_services};
use crate::converters::{GatewayConverter, IngressConverter, TcpServicesConverter};
use crate::proxy::ProxyConfig;

/// Builds one stage's converter for the current pass.
pub type ConverterFactory<T> = for<'a> fn(PassContext<'a>) -> Box<dyn Converter<T> + 'a>;

/// When a stage's converter is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    /// Constructed at pass start; its full-sync vote counts.
    Eager,
    /// Constructed only once its gate is known to be open; never votes.
    Lazy,
}

/// Whether a stage runs in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Always,
    /// `has_gateway` is enabled in the controller configuration.
    GatewayEnabled,
    /// The pass is a full sync, or the TCP services configmap changed.
    FullSyncOrTcpServicesHint,
}

impl Gate {
    pub fn is_open(self, ctx: &PassContext<'_>, full_sync: bool) -> bool {
        match self {
            Gate::Always => true,
            Gate::GatewayEnabled => ctx.options.has_gateway,
            Gate::FullSyncOrTcpServicesHint => {
                full_sync || ctx.changes.hints.tcp_config_map_data_new.is_some()
            }
        }
    }
}

pub struct Stage<T> {
    /// Timer key, recorded only when the stage runs.
    pub name: &'static str,
    pub construction: Construction,
    pub gate: Gate,
    pub factory: ConverterFactory<T>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Stage<T> {}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("construction", &self.construction)
            .field("gate", &self.gate)
            .finish()
    }
}

fn gateway_stage<'a>(ctx: PassContext<'a>) -> Box<dyn Converter<ProxyConfig> + 'a> {
    Box::new(GatewayConverter::new(ctx))
}

fn ingress_stage<'a>(ctx: PassContext<'a>) -> Box<dyn Converter<ProxyConfig> + 'a> {
    Box::new(IngressConverter::new(ctx))
}

fn tcp_services_stage<'a>(ctx: PassContext<'a>) -> Box<dyn Converter<ProxyConfig> + 'a> {
    Box::new(TcpServicesConverter::new(ctx))
}

impl Stage<ProxyConfig> {
    /// gateway → ingress → tcp services.
    pub fn defaults() -> Vec<Self> {
        vec![
            Stage {
                name: gateway::STAGE,
                construction: Construction::Eager,
                gate: Gate::GatewayEnabled,
                factory: gateway_stage,
            },
            Stage {
                name: ingress::STAGE,
                construction: Construction::Eager,
                gate: Gate::Always,
                factory: ingress_stage,
            },
            Stage {
                name: tcp_services::STAGE,
                construction: Construction::Lazy,
                gate: Gate::FullSyncOrTcpServicesHint,
                factory: tcp_services_stage,
            },
        ]
    }
}
