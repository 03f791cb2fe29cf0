//! Table rendering of a [`ProxyConfig`], shared by `sync` and `show`.

use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use lbsync_sync::proxy::{PathRoute, ProxyProtocolVersion};
use lbsync_sync::ProxyConfig;

#[derive(Tabled)]
struct PathRow {
    #[tabled(rename = "host")]
    host: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "match")]
    path_type: String,
    #[tabled(rename = "backends")]
    backends: String,
    #[tabled(rename = "tls")]
    tls: String,
    #[tabled(rename = "source")]
    owner: String,
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "backend")]
    id: String,
    #[tabled(rename = "service")]
    service: String,
    #[tabled(rename = "servers")]
    servers: usize,
    #[tabled(rename = "endpoints")]
    endpoints: String,
}

#[derive(Tabled)]
struct ListenerRow {
    #[tabled(rename = "port")]
    port: u16,
    #[tabled(rename = "listener")]
    name: String,
    #[tabled(rename = "protocol")]
    protocol: String,
    #[tabled(rename = "hostname")]
    hostname: String,
    #[tabled(rename = "source")]
    owner: String,
}

#[derive(Tabled)]
struct TcpRow {
    #[tabled(rename = "port")]
    port: u16,
    #[tabled(rename = "backend")]
    backend: String,
    #[tabled(rename = "proxy in")]
    proxy_in: String,
    #[tabled(rename = "proxy out")]
    proxy_out: String,
    #[tabled(rename = "tls")]
    tls: String,
}

pub fn print_config(config: &ProxyConfig) {
    let separator = "■".repeat(67).bright_black().to_string();

    println!(
        "{} hosts | {} paths | {} backends | {} listeners | {} tcp services",
        config.hosts.len(),
        config.path_count(),
        config.backends.len(),
        config.listeners.len(),
        config.tcp_services.len(),
    );
    if let Some(default) = &config.default_backend {
        println!("default backend: {}", default.to_string().cyan());
    }
    if config.is_empty() {
        println!("Proxy configuration is empty.");
        return;
    }

    println!("{separator}");
    if !config.listeners.is_empty() {
        println!("{}", "LISTENERS".bold());
        let rows: Vec<ListenerRow> = config
            .listeners
            .iter()
            .map(|(port, l)| ListenerRow {
                port: *port,
                name: l.name.clone(),
                protocol: format!("{:?}", l.protocol).to_uppercase(),
                hostname: l.hostname.clone().unwrap_or_else(|| "*".to_string()),
                owner: l.owner.to_string(),
            })
            .collect();
        print_table(rows);
        println!("{separator}");
    }

    if !config.hosts.is_empty() {
        println!("{}", "HOSTS".bold());
        let rows: Vec<PathRow> = config
            .hosts
            .iter()
            .flat_map(|(name, host)| {
                let tls = host
                    .tls
                    .as_ref()
                    .map(|t| t.secret.to_string().green().to_string())
                    .unwrap_or_else(|| "-".bright_black().to_string());
                host.paths.iter().map(move |p| path_row(name, p, tls.clone()))
            })
            .collect();
        print_table(rows);
        println!("{separator}");
    }

    if !config.tcp_services.is_empty() {
        println!("{}", "TCP SERVICES".bold());
        let rows: Vec<TcpRow> = config
            .tcp_services
            .iter()
            .map(|(port, t)| TcpRow {
                port: *port,
                backend: t.backend.to_string(),
                proxy_in: yes_no(t.proxy_protocol_in),
                proxy_out: match t.proxy_protocol_out {
                    Some(ProxyProtocolVersion::V1) => "v1".to_string(),
                    Some(ProxyProtocolVersion::V2) => "v2".to_string(),
                    None => "-".to_string(),
                },
                tls: t
                    .tls_secret
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        print_table(rows);
        println!("{separator}");
    }

    if !config.backends.is_empty() {
        println!("{}", "BACKENDS".bold());
        let rows: Vec<BackendRow> = config
            .backends
            .iter()
            .map(|(id, b)| BackendRow {
                id: id.to_string(),
                service: format!("{}:{}", b.service, b.port),
                servers: b.endpoints.len(),
                endpoints: if b.endpoints.is_empty() {
                    "none".red().to_string()
                } else {
                    b.endpoints.join(", ")
                },
            })
            .collect();
        print_table(rows);
        println!("{separator}");
    }
}

fn path_row(host: &str, route: &PathRoute, tls: String) -> PathRow {
    let backends = route
        .backends
        .iter()
        .map(|b| {
            if route.backends.len() == 1 {
                b.backend.to_string()
            } else {
                format!("{} ({})", b.backend, b.weight)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    PathRow {
        host: host.to_string(),
        path: route.path.clone(),
        path_type: format!("{:?}", route.path_type),
        backends,
        tls,
        owner: route.owner.to_string(),
    }
}

fn print_table<R: Tabled>(rows: Vec<R>) {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}
