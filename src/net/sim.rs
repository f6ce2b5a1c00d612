use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ReachError, Result};
use crate::net::rules::{CountingRule, Hook, RuleAction, RuleCounter, RuleSelector};
use crate::net::{HostProvisioner, HostSpec, PacketFilter, Probe, Service, Topology};

const PACKET_BYTES: u64 = 60;

#[derive(Debug, Clone)]
struct InstalledRule {
    rule: CountingRule,
    packets: u64,
    bytes: u64,
}

#[derive(Debug, Clone)]
struct ForwardRule {
    id: String,
    /// `None` matches every service.
    service: Option<Service>,
    action: RuleAction,
    packets: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct SimRouter {
    counting: Vec<InstalledRule>,
    forward: Vec<ForwardRule>,
    neighbors: BTreeSet<IpAddr>,
    /// Packets addressed through this router never reach it.
    blackholed: bool,
    /// Egress counters tick without ingress (broken counter fault).
    skewed_counters: bool,
    /// Every forwarded packet ticks egress twice.
    doubled_egress: bool,
    fail_installs: bool,
    fail_deletes: bool,
}

#[derive(Debug, Default)]
struct SimState {
    routers: BTreeMap<String, SimRouter>,
    routes: BTreeMap<(IpAddr, IpAddr), Vec<String>>,
    hosts: BTreeMap<String, HostSpec>,
    services: BTreeSet<(String, Service)>,
    host_creations: usize,
    host_removals: usize,
    fail_host_removal: bool,
    probes_sent: usize,
}

/// In-memory router fabric.
///
/// Routers hold counting rules on ingress and egress hooks plus an ordered
/// forward chain whose first matching rule decides the packet's fate.
/// Probes follow configured routes hop by hop and tick exactly the counters
/// a kernel would.
#[derive(Debug, Default)]
pub struct SimNetwork {
    state: Mutex<SimState>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_router(&self, name: &str) {
        self.state.lock().routers.entry(name.to_string()).or_default();
    }

    /// Register a route; unknown routers on the path are created.
    pub fn add_route(&self, source: IpAddr, destination: IpAddr, path: &[&str]) {
        let mut state = self.state.lock();
        for router in path {
            state.routers.entry(router.to_string()).or_default();
        }
        state.routes.insert(
            (source, destination),
            path.iter().map(|r| r.to_string()).collect(),
        );
    }

    /// Append a forward-chain rule. `service: None` matches everything.
    pub fn add_forward_rule(&self, router: &str, id: &str, service: Option<Service>, action: RuleAction) {
        let mut state = self.state.lock();
        state
            .routers
            .entry(router.to_string())
            .or_default()
            .forward
            .push(ForwardRule {
                id: id.to_string(),
                service,
                action,
                packets: 0,
                bytes: 0,
            });
    }

    /// Drop `service` at `router`'s forward chain, ahead of any other rule.
    pub fn block(&self, router: &str, service: Service) {
        let mut state = self.state.lock();
        state
            .routers
            .entry(router.to_string())
            .or_default()
            .forward
            .insert(
                0,
                ForwardRule {
                    id: format!("block-{}", service),
                    service: Some(service),
                    action: RuleAction::Drop,
                    packets: 0,
                    bytes: 0,
                },
            );
    }

    pub fn blackhole(&self, router: &str) {
        self.with_router(router, |r| r.blackholed = true);
    }

    pub fn skew_counters(&self, router: &str) {
        self.with_router(router, |r| r.skewed_counters = true);
    }

    pub fn double_egress_counters(&self, router: &str) {
        self.with_router(router, |r| r.doubled_egress = true);
    }

    pub fn fail_installs(&self, router: &str) {
        self.with_router(router, |r| r.fail_installs = true);
    }

    pub fn fail_deletes(&self, router: &str) {
        self.with_router(router, |r| r.fail_deletes = true);
    }

    pub fn fail_host_removal(&self, fail: bool) {
        self.state.lock().fail_host_removal = fail;
    }

    fn with_router(&self, router: &str, f: impl FnOnce(&mut SimRouter)) {
        let mut state = self.state.lock();
        f(state.routers.entry(router.to_string()).or_default());
    }

    /// Counting rules currently installed on `router`.
    pub fn counting_rules(&self, router: &str) -> Vec<CountingRule> {
        self.state
            .lock()
            .routers
            .get(router)
            .map(|r| r.counting.iter().map(|i| i.rule.clone()).collect())
            .unwrap_or_default()
    }

    pub fn rules_with_tag(&self, router: &str, tag: u8) -> usize {
        self.counting_rules(router)
            .iter()
            .filter(|r| r.tag == tag)
            .count()
    }

    pub fn host_exists(&self, name: &str) -> bool {
        self.state.lock().hosts.contains_key(name)
    }

    pub fn host_creations(&self) -> usize {
        self.state.lock().host_creations
    }

    pub fn host_removals(&self) -> usize {
        self.state.lock().host_removals
    }

    pub fn has_neighbor(&self, router: &str, address: IpAddr) -> bool {
        self.state
            .lock()
            .routers
            .get(router)
            .is_some_and(|r| r.neighbors.contains(&address))
    }

    pub fn service_running(&self, host: &str, service: Service) -> bool {
        self.state
            .lock()
            .services
            .contains(&(host.to_string(), service))
    }

    pub fn probes_sent(&self) -> usize {
        self.state.lock().probes_sent
    }

    fn router_mut<'a>(state: &'a mut SimState, router: &str) -> Result<&'a mut SimRouter> {
        state
            .routers
            .get_mut(router)
            .ok_or_else(|| ReachError::Provisioning(format!("unknown router {router}")))
    }
}

fn tick(rule: &mut InstalledRule) {
    rule.packets += 1;
    rule.bytes += PACKET_BYTES;
}

fn counts(rule: &InstalledRule, hook: Hook, tag: Option<u8>, service: &Service) -> bool {
    rule.rule.hook == hook && Some(rule.rule.tag) == tag && rule.rule.service == *service
}

#[async_trait]
impl Topology for SimNetwork {
    async fn resolve_path(&self, source: IpAddr, destination: IpAddr) -> Result<Vec<String>> {
        self.state
            .lock()
            .routes
            .get(&(source, destination))
            .cloned()
            .ok_or_else(|| ReachError::InvalidJob(format!("no path from {source} to {destination}")))
    }
}

#[async_trait]
impl HostProvisioner for SimNetwork {
    async fn create_host(&self, host: &HostSpec) -> Result<()> {
        let mut state = self.state.lock();
        if !state.routers.contains_key(&host.router) {
            return Err(ReachError::Provisioning(format!(
                "cannot attach {} to unknown router {}",
                host.name, host.router
            )));
        }
        if !state.hosts.contains_key(&host.name) {
            state.hosts.insert(host.name.clone(), host.clone());
            state.host_creations += 1;
        }
        Ok(())
    }

    async fn remove_host(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_host_removal {
            return Err(ReachError::Provisioning(format!("cannot remove host {name}")));
        }
        if state.hosts.remove(name).is_some() {
            state.host_removals += 1;
            state.services.retain(|(h, _)| h != name);
        }
        Ok(())
    }

    async fn create_ephemeral_service(&self, host: &str, service: &Service) -> Result<()> {
        let mut state = self.state.lock();
        if !state.hosts.contains_key(host) {
            return Err(ReachError::Provisioning(format!("no such host {host}")));
        }
        state.services.insert((host.to_string(), *service));
        Ok(())
    }

    async fn stop_service(&self, host: &str, service: &Service) -> Result<()> {
        self.state
            .lock()
            .services
            .remove(&(host.to_string(), *service));
        Ok(())
    }

    async fn add_neighbor(&self, router: &str, address: IpAddr) -> Result<()> {
        let mut state = self.state.lock();
        Self::router_mut(&mut state, router)?.neighbors.insert(address);
        Ok(())
    }

    async fn remove_neighbor(&self, router: &str, address: IpAddr) -> Result<()> {
        let mut state = self.state.lock();
        Self::router_mut(&mut state, router)?.neighbors.remove(&address);
        Ok(())
    }
}

#[async_trait]
impl PacketFilter for SimNetwork {
    async fn install_rules(&self, router: &str, rules: &[CountingRule]) -> Result<()> {
        let mut state = self.state.lock();
        let r = Self::router_mut(&mut state, router)?;
        if r.fail_installs {
            return Err(ReachError::Provisioning(format!(
                "rule install rejected on {router}"
            )));
        }
        r.counting.extend(rules.iter().map(|rule| InstalledRule {
            rule: rule.clone(),
            packets: 0,
            bytes: 0,
        }));
        Ok(())
    }

    async fn delete_rules(&self, router: &str, selector: &RuleSelector) -> Result<usize> {
        let mut state = self.state.lock();
        let r = Self::router_mut(&mut state, router)?;
        if r.fail_deletes && r.counting.iter().any(|i| selector.matches(&i.rule)) {
            return Err(ReachError::Provisioning(format!("rule delete rejected on {router}")));
        }
        let before = r.counting.len();
        r.counting.retain(|i| !selector.matches(&i.rule));
        Ok(before - r.counting.len())
    }

    async fn read_counters(&self, router: &str, selector: &RuleSelector) -> Result<Vec<RuleCounter>> {
        let mut state = self.state.lock();
        let r = Self::router_mut(&mut state, router)?;
        if selector.hook == Some(Hook::Forward) {
            return Ok(r
                .forward
                .iter()
                .map(|f| RuleCounter {
                    rule_id: f.id.clone(),
                    hook: Hook::Forward,
                    action: f.action,
                    counting: None,
                    packets: f.packets,
                    bytes: f.bytes,
                })
                .collect());
        }
        Ok(r
            .counting
            .iter()
            .filter(|i| selector.matches(&i.rule))
            .map(|i| RuleCounter {
                rule_id: i.rule.comment(),
                hook: i.rule.hook,
                action: RuleAction::Other,
                counting: Some(i.rule.clone()),
                packets: i.packets,
                bytes: i.bytes,
            })
            .collect())
    }

    async fn send_probe(&self, probe: &Probe) -> Result<()> {
        let mut state = self.state.lock();
        state.probes_sent += 1;
        let Some(path) = state.routes.get(&(probe.source, probe.destination)).cloned() else {
            // unroutable: packets vanish before any router sees them
            return Ok(());
        };

        for _ in 0..probe.count.max(1) {
            for name in &path {
                let Some(router) = state.routers.get_mut(name) else {
                    break;
                };
                if router.blackholed {
                    break;
                }
                if !router.skewed_counters {
                    router
                        .counting
                        .iter_mut()
                        .filter(|i| counts(i, Hook::PreRouting, probe.tag, &probe.service))
                        .for_each(tick);
                }

                let verdict = router
                    .forward
                    .iter_mut()
                    .find(|f| f.service.map_or(true, |s| s == probe.service));
                let action = match verdict {
                    Some(rule) => {
                        rule.packets += 1;
                        rule.bytes += PACKET_BYTES;
                        rule.action
                    }
                    None => RuleAction::Accept,
                };
                if matches!(action, RuleAction::Drop | RuleAction::Reject) && !router.skewed_counters {
                    break;
                }

                let ticks = if router.doubled_egress { 2 } else { 1 };
                for _ in 0..ticks {
                    router
                        .counting
                        .iter_mut()
                        .filter(|i| counts(i, Hook::PostRouting, probe.tag, &probe.service))
                        .for_each(tick);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn tagged_probe_ticks_only_matching_rules() {
        let net = SimNetwork::new();
        net.add_route(addr("10.0.0.1"), addr("10.0.1.1"), &["r1"]);
        let job = Uuid::new_v4();
        let mut rules = CountingRule::pair(32, job, Service::tcp(80)).to_vec();
        rules.extend(CountingRule::pair(33, job, Service::tcp(80)));
        net.install_rules("r1", &rules).await.unwrap();

        net.send_probe(&Probe {
            origin: "r1".into(),
            source: addr("10.0.0.1"),
            destination: addr("10.0.1.1"),
            service: Service::tcp(80),
            tag: Some(32),
            count: 1,
        })
        .await
        .unwrap();

        let ours = net.read_counters("r1", &RuleSelector::tag(32)).await.unwrap();
        assert!(ours.iter().all(|c| c.packets == 1));
        let theirs = net.read_counters("r1", &RuleSelector::tag(33)).await.unwrap();
        assert!(theirs.iter().all(|c| c.packets == 0));
    }

    #[tokio::test]
    async fn blocked_service_stops_before_egress() {
        let net = SimNetwork::new();
        net.add_route(addr("10.0.0.1"), addr("10.0.1.1"), &["r1", "r2"]);
        net.block("r1", Service::tcp(22));
        let job = Uuid::new_v4();
        for r in ["r1", "r2"] {
            net.install_rules(r, &CountingRule::pair(40, job, Service::tcp(22)))
                .await
                .unwrap();
        }
        net.send_probe(&Probe {
            origin: "r1".into(),
            source: addr("10.0.0.1"),
            destination: addr("10.0.1.1"),
            service: Service::tcp(22),
            tag: Some(40),
            count: 2,
        })
        .await
        .unwrap();

        let r1 = net.read_counters("r1", &RuleSelector::tag(40)).await.unwrap();
        let pre = r1.iter().find(|c| c.hook == Hook::PreRouting).unwrap();
        let post = r1.iter().find(|c| c.hook == Hook::PostRouting).unwrap();
        assert_eq!((pre.packets, post.packets), (2, 0));
        let r2 = net.read_counters("r2", &RuleSelector::tag(40)).await.unwrap();
        assert!(r2.iter().all(|c| c.packets == 0));
    }

    #[tokio::test]
    async fn create_host_is_idempotent() {
        let net = SimNetwork::new();
        net.add_router("r1");
        let host = HostSpec {
            name: "src-1".into(),
            address: addr("10.0.0.5"),
            router: "r1".into(),
        };
        net.create_host(&host).await.unwrap();
        net.create_host(&host).await.unwrap();
        assert_eq!(net.host_creations(), 1);
        net.remove_host("src-1").await.unwrap();
        assert!(!net.host_exists("src-1"));
    }
}
