use std::net::IpAddr;

const AGENT_PORT: &str = "AGENT_PORT";

pub fn get_port() -> Option<u16> {
    let port_from_env = std::env::var(AGENT_PORT);
    port_from_env.ok().and_then(|res| res.parse().ok())
}

const AGENT_ADDR: &str = "AGENT_ADDR";

pub fn get_addr() -> Option<IpAddr> {
    let addr_from_env = std::env::var(AGENT_ADDR);
    addr_from_env.ok().and_then(|res| res.parse().ok())
}

const AGENT_SECRET: &str = "AGENT_SECRET";

pub fn get_secret() -> Option<String> {
    let secret_from_env = std::env::var(AGENT_SECRET);
    secret_from_env.ok().filter(|secret| !secret.is_empty())
}
