//! Stateful mock for the command-runner seam.
//!
//! [`MockRunner`] emulates the iptables, calicoctl, ip, arping and ping CLIs
//! over an in-memory [`StoreState`], so tests can assert on resulting store
//! *state* after an operation, not just on which calls happened. The full
//! call log is still recorded for the idempotence assertions.
//!
//! Uses `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::exec::{Captured, CommandRunner, Error};

const NOT_FOUND: &str = "iptables: No chain/target/match by that name.";
const LOCK_HELD: &str =
    "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?";
const CHAIN_EXISTS: &str = "iptables: Chain already exists.";
const RULE_PRESENT: &str = "Rule already present, skipping.";

#[derive(Debug, Default)]
pub struct StoreState {
    /// chain name -> rule specification strings, in order.
    pub chains: BTreeMap<String, Vec<String>>,
    pub profiles: Vec<String>,
    /// (profile, rendered rule) pairs.
    pub profile_rules: Vec<(String, String)>,
    /// device -> bound addresses as `<ip>/32`.
    pub addrs: BTreeMap<String, Vec<String>>,
    /// Next N iptables invocations fail with the lock-held diagnostic.
    pub contended: u32,
    /// Whether ping probes succeed.
    pub alive: bool,
    /// Map of operation token -> stderr. If set, the operation fails with it.
    pub fail_on: BTreeMap<String, String>,
    /// When set, re-adding an existing calico rule exits nonzero with the
    /// "already present" diagnostic instead of silently succeeding.
    pub calico_rule_conflict: bool,
    /// Full call log: (program, args).
    pub calls: Vec<(String, Vec<String>)>,
}

impl StoreState {
    /// Store with the built-in NAT chains only.
    pub fn with_builtins() -> Self {
        let mut state = StoreState {
            alive: true,
            ..StoreState::default()
        };
        state.add_chain("PREROUTING");
        state.add_chain("OUTPUT");
        state
    }

    pub fn add_chain(&mut self, chain: &str) {
        self.chains.insert(chain.to_string(), Vec::new());
    }
}

#[derive(Clone)]
pub struct MockRunner {
    pub state: Arc<Mutex<StoreState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::with_state(StoreState::with_builtins())
    }

    pub fn with_state(state: StoreState) -> Self {
        MockRunner {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn seed_rule(&self, chain: &str, spec: &str) {
        let mut s = self.state.lock().unwrap();
        s.chains
            .get_mut(chain)
            .expect("seeding rule into missing chain")
            .push(spec.to_string());
    }

    pub fn seed_profile(&self, name: &str) {
        self.state.lock().unwrap().profiles.push(name.to_string());
    }

    pub fn seed_addr(&self, device: &str, cidr: &str) {
        let mut s = self.state.lock().unwrap();
        s.addrs
            .entry(device.to_string())
            .or_default()
            .push(cidr.to_string());
    }

    /// Makes the next `n` iptables invocations fail with the lock diagnostic.
    pub fn contend(&self, n: u32) {
        self.state.lock().unwrap().contended = n;
    }

    pub fn fail_on(&self, token: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(token.to_string(), stderr.to_string());
    }

    pub fn chain_rules(&self, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn profile_rules(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .profile_rules
            .iter()
            .filter(|(p, _)| p == name)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn device_addrs(&self, device: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .addrs
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of recorded `program` invocations whose argv contains `token`.
    pub fn command_count(&self, program: &str, token: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(p, args)| p == program && args.iter().any(|a| a == token))
            .count()
    }

    fn iptables(s: &mut StoreState, args: &[String]) -> Captured {
        if s.contended > 0 {
            s.contended -= 1;
            return Captured::failed(LOCK_HELD);
        }

        let sub_idx = args
            .iter()
            .position(|a| matches!(a.as_str(), "-C" | "-A" | "-D" | "-N" | "-L" | "-S"))
            .expect("iptables call without a subcommand");
        let sub = args[sub_idx].clone();
        let chain = args[sub_idx + 1].clone();
        let spec = args[sub_idx + 2..].join(" ");

        if let Some(stderr) = s.fail_on.get(&sub) {
            return Captured::failed(stderr.clone());
        }

        match sub.as_str() {
            "-N" => {
                if s.chains.contains_key(&chain) {
                    return Captured::failed(CHAIN_EXISTS);
                }
                s.add_chain(&chain);
                Captured::ok("")
            }
            "-L" => {
                if s.chains.contains_key(&chain) {
                    Captured::ok(format!("Chain {chain} (0 references)\n"))
                } else {
                    Captured::failed(NOT_FOUND)
                }
            }
            "-S" => match s.chains.get(&chain) {
                Some(rules) => {
                    let mut listing = format!("-N {chain}\n");
                    for rule in rules {
                        listing.push_str(&format!("-A {chain} {rule}\n"));
                    }
                    Captured::ok(listing)
                }
                None => Captured::failed(NOT_FOUND),
            },
            "-C" => match s.chains.get(&chain) {
                Some(rules) if rules.iter().any(|r| r == &spec) => Captured::ok(""),
                _ => Captured::failed(NOT_FOUND),
            },
            "-A" => match s.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.push(spec);
                    Captured::ok("")
                }
                None => Captured::failed(NOT_FOUND),
            },
            "-D" => match s.chains.get_mut(&chain) {
                Some(rules) => match rules.iter().position(|r| r == &spec) {
                    Some(idx) => {
                        rules.remove(idx);
                        Captured::ok("")
                    }
                    None => Captured::failed(NOT_FOUND),
                },
                None => Captured::failed(NOT_FOUND),
            },
            _ => unreachable!(),
        }
    }

    fn calicoctl(s: &mut StoreState, args: &[String]) -> Captured {
        assert_eq!(args[0], "profile", "unexpected calicoctl call: {args:?}");

        if args[1] == "add" {
            if let Some(stderr) = s.fail_on.get("profile-add") {
                return Captured::failed(stderr.clone());
            }
            let name = args[2].clone();
            if !s.profiles.contains(&name) {
                s.profiles.push(name);
            }
            return Captured::ok("");
        }

        // calicoctl profile <name> rule add inbound --at=1 allow ...
        let name = args[1].clone();
        if let Some(stderr) = s.fail_on.get("rule-add") {
            return Captured::failed(stderr.clone());
        }
        if !s.profiles.contains(&name) {
            return Captured::failed(format!("Profile {name} not found."));
        }
        // keep only the allow predicate; direction and position are fixed
        let rendered = args[6..].join(" ");
        let exists = s.profile_rules.iter().any(|(p, r)| p == &name && r == &rendered);
        if exists {
            if s.calico_rule_conflict {
                return Captured::failed(RULE_PRESENT);
            }
            return Captured::ok(RULE_PRESENT);
        }
        s.profile_rules.push((name, rendered));
        Captured::ok("")
    }

    fn ip(s: &mut StoreState, args: &[String]) -> Captured {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["-o", "-4", "addr", "show", "dev", device] => match s.addrs.get(*device) {
                Some(cidrs) => {
                    let lines: Vec<String> = cidrs
                        .iter()
                        .map(|c| format!("2: {device}    inet {c} scope global {device}"))
                        .collect();
                    Captured::ok(lines.join("\n"))
                }
                None => Captured::failed(format!("Device \"{device}\" does not exist.")),
            },
            ["-o", "addr", "add", cidr, "dev", device] => {
                s.addrs
                    .entry(device.to_string())
                    .or_default()
                    .push(cidr.to_string());
                Captured::ok("")
            }
            ["-o", "addr", "delete", cidr, "dev", device] => {
                match s.addrs.get_mut(*device) {
                    Some(cidrs) => match cidrs.iter().position(|c| c == cidr) {
                        Some(idx) => {
                            cidrs.remove(idx);
                            Captured::ok("")
                        }
                        None => Captured::failed("RTNETLINK answers: Cannot assign requested address"),
                    },
                    None => Captured::failed(format!("Device \"{device}\" does not exist.")),
                }
            }
            other => unreachable!("unexpected ip call: {other:?}"),
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<Captured, Error> {
        let mut s = self.state.lock().unwrap();
        s.calls.push((program.to_string(), args.to_vec()));

        let out = match program {
            "iptables" => Self::iptables(&mut s, args),
            "calicoctl" => Self::calicoctl(&mut s, args),
            "ip" => Self::ip(&mut s, args),
            "arping" => {
                if let Some(stderr) = s.fail_on.get("arping") {
                    Captured::failed(stderr.clone())
                } else {
                    Captured::ok("")
                }
            }
            "ping" => {
                if s.alive {
                    Captured::ok("3 packets transmitted, 3 received")
                } else {
                    Captured::failed("")
                }
            }
            other => unreachable!("unexpected program: {other}"),
        };
        Ok(out)
    }
}
