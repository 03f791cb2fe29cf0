//! Resource-domain converters, one per stage.
//!
//! | stage           | converter                | domain                         |
//! |-----------------|--------------------------|--------------------------------|
//! | `parse_gateway` | [`GatewayConverter`]     | Gateway listeners + HTTPRoutes |
//! | `parse_ingress` | [`IngressConverter`]     | Ingresses, default backend     |
//! | `parse_tcp_svc` | [`TcpServicesConverter`] | TCP services configmap         |

mod backend;
pub mod gateway;
pub mod ingress;
pub mod tcp_services;

pub use gateway::GatewayConverter;
pub use ingress::IngressConverter;
pub use tcp_services::{TcpServiceEntry, TcpServicesConverter};
