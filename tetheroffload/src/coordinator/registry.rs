// Per-downstream rule tables and the first/last rule transitions

use std::collections::BTreeMap;

use super::upstream::UpstreamTable;
use crate::backends::offload::OffloadBackend;
use crate::rule::{DownstreamId, ForwardingRule};

/// Rules of every downstream, in insertion order, unique by neighbor address
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<DownstreamId, Vec<ForwardingRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of a downstream, empty when unknown
    pub fn rules_for(&self, downstream: &DownstreamId) -> &[ForwardingRule] {
        self.rules.get(downstream).map_or(&[], |r| r.as_slice())
    }

    pub fn downstreams(&self) -> Vec<DownstreamId> {
        self.rules.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DownstreamId, &Vec<ForwardingRule>)> {
        self.rules.iter()
    }

    /// Live rules entering on `downstream_if_index`. The active-upstream binding
    /// is keyed by that interface alone, so it lives while this is nonzero.
    fn rules_on_interface(&self, downstream_if_index: u32) -> usize {
        self.rules
            .values()
            .flatten()
            .filter(|r| r.downstream_if_index == downstream_if_index)
            .count()
    }

    /// Install a rule. Returns true when the rule was recorded.
    pub fn add_rule(
        &mut self,
        downstream: &DownstreamId,
        rule: ForwardingRule,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) -> bool {
        if self
            .rules_for(downstream)
            .iter()
            .any(|r| r.neighbor == rule.neighbor)
        {
            log::warn!(
                "Ignoring duplicate rule for {} on downstream {}",
                rule.neighbor,
                downstream
            );
            return false;
        }
        let binding_needed = self.rules_on_interface(rule.downstream_if_index) == 0;

        if let Err(e) = backend.add_rule(&rule) {
            log::error!("Failed to add rule on downstream {}: {:#}", downstream, e);
            return false;
        }

        self.rules.entry(downstream.clone()).or_default().push(rule);
        log::debug!("Added rule {} on downstream {}", rule, downstream);

        let (before, after) = upstreams.acquire(rule.upstream_if_index);
        if before == 0 && after > 0 {
            let quota = upstreams.get_or_create(rule.upstream_if_index).quota;
            if let Err(e) = backend.set_quota(rule.upstream_if_index, quota, true) {
                log::error!(
                    "Failed to initialize quota on upstream {}: {:#}",
                    rule.upstream_if_index,
                    e
                );
            }
        }

        if binding_needed {
            if let Err(e) =
                backend.start_upstream_forwarding(rule.downstream_if_index, rule.upstream_if_index)
            {
                log::error!(
                    "Failed to start upstream forwarding {} -> {}: {:#}",
                    rule.downstream_if_index,
                    rule.upstream_if_index,
                    e
                );
            }
        }

        true
    }

    /// Remove the rule with the same neighbor address. Returns true when it was removed.
    pub fn remove_rule(
        &mut self,
        downstream: &DownstreamId,
        rule: &ForwardingRule,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) -> bool {
        let Some(rules) = self.rules.get_mut(downstream) else {
            log::debug!("No rules for downstream {}", downstream);
            return false;
        };
        let Some(pos) = rules.iter().position(|r| r.neighbor == rule.neighbor) else {
            log::debug!(
                "No rule for {} on downstream {}",
                rule.neighbor,
                downstream
            );
            return false;
        };
        let stored = rules[pos];

        if let Err(e) = backend.remove_rule(&stored) {
            log::error!("Failed to remove rule on downstream {}: {:#}", downstream, e);
            return false;
        }

        rules.remove(pos);
        log::debug!("Removed rule {} on downstream {}", stored, downstream);

        if self.rules_on_interface(stored.downstream_if_index) == 0 {
            if let Err(e) = backend
                .stop_upstream_forwarding(stored.downstream_if_index, stored.upstream_if_index)
            {
                log::error!(
                    "Failed to stop upstream forwarding {} -> {}: {:#}",
                    stored.downstream_if_index,
                    stored.upstream_if_index,
                    e
                );
            }
        }

        let (before, after) = upstreams.release(stored.upstream_if_index);
        if before > 0 && after == 0 {
            match backend.get_and_clear_stats(stored.upstream_if_index) {
                Ok(last) => upstreams.fold_final(last.if_index, last.stats),
                Err(e) => log::error!(
                    "Failed to clear stats of upstream {}: {:#}",
                    stored.upstream_if_index,
                    e
                ),
            }
        }

        true
    }

    /// Rebind every rule of the downstream to a new upstream:
    /// remove all in insertion order, then add the rebuilt rules in the same order
    pub fn update_rules(
        &mut self,
        downstream: &DownstreamId,
        new_upstream_if_index: u32,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) {
        let snapshot = self.rules_for(downstream).to_vec();
        if snapshot.is_empty() {
            log::debug!("No rules to update on downstream {}", downstream);
            return;
        }

        let mut removed = Vec::with_capacity(snapshot.len());
        for rule in &snapshot {
            if self.remove_rule(downstream, rule, backend, upstreams) {
                removed.push(*rule);
            }
        }
        for rule in removed {
            self.add_rule(
                downstream,
                rule.on_new_upstream(new_upstream_if_index),
                backend,
                upstreams,
            );
        }
    }

    /// Remove every rule of the downstream in insertion order and forget it
    pub fn clear_rules(
        &mut self,
        downstream: &DownstreamId,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) {
        let snapshot = self.rules_for(downstream).to_vec();
        for rule in &snapshot {
            self.remove_rule(downstream, rule, backend, upstreams);
        }

        if self.rules_for(downstream).is_empty() {
            self.rules.remove(downstream);
        } else {
            log::warn!(
                "Downstream {} kept {} rules that failed to clear",
                downstream,
                self.rules_for(downstream).len()
            );
        }
    }

    /// Live rules whose upstream is `if_index`, across all downstreams
    #[cfg(test)]
    pub fn count_for_upstream(&self, if_index: u32) -> usize {
        self.rules
            .values()
            .flatten()
            .filter(|r| r.upstream_if_index == if_index)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BackendCall, RecordingBackend};
    use std::net::Ipv6Addr;

    const UPSTREAM: u32 = 100;
    const DOWNSTREAM_IF: u32 = 10;

    fn rule(upstream: u32, last: u16) -> ForwardingRule {
        ForwardingRule::new(
            upstream,
            DOWNSTREAM_IF,
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last),
            "00:00:00:00:00:0b".parse().unwrap(),
            "00:00:00:00:00:0a".parse().unwrap(),
        )
    }

    struct Fixture {
        registry: RuleRegistry,
        backend: RecordingBackend,
        upstreams: UpstreamTable,
        ds: DownstreamId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: RuleRegistry::new(),
                backend: RecordingBackend::new(),
                upstreams: UpstreamTable::new(),
                ds: DownstreamId::new("wlan0-ipserver"),
            }
        }

        fn add(&mut self, rule: ForwardingRule) -> bool {
            self.registry
                .add_rule(&self.ds, rule, &mut self.backend, &mut self.upstreams)
        }

        fn remove(&mut self, rule: ForwardingRule) -> bool {
            self.registry
                .remove_rule(&self.ds, &rule, &mut self.backend, &mut self.upstreams)
        }

        fn assert_counts_consistent(&self) {
            for record in self.upstreams.iter() {
                assert_eq!(
                    record.rule_count,
                    self.registry.count_for_upstream(record.if_index),
                    "rule count of upstream {}",
                    record.if_index
                );
            }
        }
    }

    #[test]
    fn test_first_and_last_rule_triggers() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        let b = rule(UPSTREAM, 2);

        assert!(f.add(a));
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::AddRule(a),
                BackendCall::SetQuota(UPSTREAM, -1, true),
                BackendCall::StartUpstream(DOWNSTREAM_IF, UPSTREAM),
            ]
        );

        assert!(f.add(b));
        assert_eq!(f.backend.take_calls(), vec![BackendCall::AddRule(b)]);

        assert!(f.remove(b));
        assert_eq!(f.backend.take_calls(), vec![BackendCall::RemoveRule(b)]);

        assert!(f.remove(a));
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::RemoveRule(a),
                BackendCall::StopUpstream(DOWNSTREAM_IF, UPSTREAM),
                BackendCall::GetAndClear(UPSTREAM),
            ]
        );
        f.assert_counts_consistent();
        assert!(f.registry.rules_for(&f.ds).is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown_are_noops() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        assert!(f.add(a));
        f.backend.take_calls();

        assert!(!f.add(a));
        assert!(!f.remove(rule(UPSTREAM, 9)));
        assert!(
            !f.registry.remove_rule(
                &DownstreamId::new("other"),
                &a,
                &mut f.backend,
                &mut f.upstreams
            )
        );
        f.registry.clear_rules(
            &DownstreamId::new("other"),
            &mut f.backend,
            &mut f.upstreams,
        );
        f.registry.update_rules(
            &DownstreamId::new("other"),
            101,
            &mut f.backend,
            &mut f.upstreams,
        );

        assert!(f.backend.take_calls().is_empty());
        assert_eq!(f.registry.rules_for(&f.ds), &[a]);
        f.assert_counts_consistent();
    }

    #[test]
    fn test_failed_add_is_not_recorded() {
        let mut f = Fixture::new();
        f.backend.fail_rule_ops(true);
        assert!(!f.add(rule(UPSTREAM, 1)));
        assert!(f.registry.rules_for(&f.ds).is_empty());
        assert_eq!(f.upstreams.rule_count(UPSTREAM), 0);

        // Only the failed add reached the backend
        assert_eq!(f.backend.take_calls().len(), 1);
    }

    #[test]
    fn test_failed_remove_leaves_state() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        f.add(a);
        f.backend.take_calls();

        f.backend.fail_rule_ops(true);
        assert!(!f.remove(a));
        assert_eq!(f.registry.rules_for(&f.ds), &[a]);
        assert_eq!(f.upstreams.rule_count(UPSTREAM), 1);
        assert_eq!(f.backend.take_calls(), vec![BackendCall::RemoveRule(a)]);
        f.assert_counts_consistent();
    }

    #[test]
    fn test_update_rules_removes_all_then_adds_all() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        let b = rule(UPSTREAM, 2);
        f.add(a);
        f.add(b);
        f.backend.take_calls();

        f.registry
            .update_rules(&f.ds, 101, &mut f.backend, &mut f.upstreams);

        let a2 = a.on_new_upstream(101);
        let b2 = b.on_new_upstream(101);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::RemoveRule(a),
                BackendCall::RemoveRule(b),
                BackendCall::StopUpstream(DOWNSTREAM_IF, UPSTREAM),
                BackendCall::GetAndClear(UPSTREAM),
                BackendCall::AddRule(a2),
                BackendCall::SetQuota(101, -1, true),
                BackendCall::StartUpstream(DOWNSTREAM_IF, 101),
                BackendCall::AddRule(b2),
            ]
        );
        assert_eq!(f.registry.rules_for(&f.ds), &[a2, b2]);
        assert_eq!(f.upstreams.rule_count(UPSTREAM), 0);
        assert_eq!(f.upstreams.rule_count(101), 2);
        f.assert_counts_consistent();
    }

    #[test]
    fn test_clear_rules_drops_downstream() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        let b = rule(UPSTREAM, 2);
        f.add(a);
        f.add(b);
        f.backend.take_calls();

        f.registry
            .clear_rules(&f.ds, &mut f.backend, &mut f.upstreams);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::RemoveRule(a),
                BackendCall::RemoveRule(b),
                BackendCall::StopUpstream(DOWNSTREAM_IF, UPSTREAM),
                BackendCall::GetAndClear(UPSTREAM),
            ]
        );
        assert!(f.registry.downstreams().is_empty());
        f.assert_counts_consistent();
    }

    #[test]
    fn test_quota_gating_is_global_across_downstreams() {
        let mut f = Fixture::new();
        let other = DownstreamId::new("usb0-ipserver");
        let a = rule(UPSTREAM, 1);
        let mut c = rule(UPSTREAM, 3);
        c.downstream_if_index = 11;

        f.add(a);
        f.registry
            .add_rule(&other, c, &mut f.backend, &mut f.upstreams);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::AddRule(a),
                BackendCall::SetQuota(UPSTREAM, -1, true),
                BackendCall::StartUpstream(DOWNSTREAM_IF, UPSTREAM),
                BackendCall::AddRule(c),
                BackendCall::StartUpstream(11, UPSTREAM),
            ]
        );

        // The upstream stays referenced by the other downstream
        f.remove(a);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::RemoveRule(a),
                BackendCall::StopUpstream(DOWNSTREAM_IF, UPSTREAM),
            ]
        );
        assert_eq!(f.upstreams.rule_count(UPSTREAM), 1);
        f.assert_counts_consistent();
    }

    #[test]
    fn test_binding_kept_while_interface_has_rules_on_another_upstream() {
        let mut f = Fixture::new();
        let a = rule(UPSTREAM, 1);
        let b = rule(101, 2);

        // Rules on two upstreams, as a partly failed update can leave them
        f.add(a);
        f.add(b);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::AddRule(a),
                BackendCall::SetQuota(UPSTREAM, -1, true),
                BackendCall::StartUpstream(DOWNSTREAM_IF, UPSTREAM),
                BackendCall::AddRule(b),
                BackendCall::SetQuota(101, -1, true),
            ]
        );

        f.remove(a);
        assert_eq!(
            f.backend.take_calls(),
            vec![BackendCall::RemoveRule(a), BackendCall::GetAndClear(UPSTREAM)]
        );

        f.remove(b);
        assert_eq!(
            f.backend.take_calls(),
            vec![
                BackendCall::RemoveRule(b),
                BackendCall::StopUpstream(DOWNSTREAM_IF, 101),
                BackendCall::GetAndClear(101),
            ]
        );
        f.assert_counts_consistent();
    }

    #[test]
    fn test_quota_init_uses_stored_limit() {
        let mut f = Fixture::new();
        f.upstreams.get_or_create(UPSTREAM).quota = 5000;
        f.add(rule(UPSTREAM, 1));
        assert!(
            f.backend
                .take_calls()
                .contains(&BackendCall::SetQuota(UPSTREAM, 5000, true))
        );
    }
}
