//! Schedule Policy (`spec.md` §4.5 step "Plan" / §2 component 7): orders
//! the waiting queue before the Prefill Adder walks it. Named after the
//! original's `self.policy = SchedulePolicy(self.schedule_policy, self.tree_cache)`.

use crate::types::Req;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    LongestPrefix,
    ShortestOutputFirst,
}

impl SchedulePolicy {
    /// Reorders `waiting` in place. Stable: within equal rank, waiting-queue
    /// order is preserved (`spec.md` §4.4 "Tie-breaks").
    pub fn order(self, waiting: &mut [Req]) {
        match self {
            SchedulePolicy::LongestPrefix => {
                waiting.sort_by_key(|req| std::cmp::Reverse(req.cached_len))
            }
            SchedulePolicy::ShortestOutputFirst => {
                waiting.sort_by_key(|req| req.sampling_params.max_new_tokens())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplingParams;

    fn req(rid: &str, cached_len: usize, max_new_tokens: u32) -> Req {
        let mut r = Req::new(
            rid,
            vec![1, 2, 3],
            SamplingParams {
                max_new_tokens: Some(max_new_tokens),
                ..SamplingParams::default()
            },
        );
        r.cached_len = cached_len;
        r
    }

    #[test]
    fn longest_prefix_sorts_descending_by_cached_len() {
        let mut waiting = vec![req("a", 10, 5), req("b", 50, 5), req("c", 30, 5)];
        SchedulePolicy::LongestPrefix.order(&mut waiting);
        let rids: Vec<&str> = waiting.iter().map(|r| &*r.rid).collect();
        assert_eq!(rids, vec!["b", "c", "a"]);
    }

    #[test]
    fn shortest_output_first_sorts_ascending_by_max_new_tokens() {
        let mut waiting = vec![req("a", 0, 50), req("b", 0, 5), req("c", 0, 20)];
        SchedulePolicy::ShortestOutputFirst.order(&mut waiting);
        let rids: Vec<&str> = waiting.iter().map(|r| &*r.rid).collect();
        assert_eq!(rids, vec!["b", "c", "a"]);
    }
}
