//! # comprehensive raft tests
//!
//! why: verify all raft consensus and client session scenarios work correctly
//! relations: tests the raftline-core node, commit pipeline and session layer together
//! what: election, replication, commit, sequencing, sessions, queries, events, step-down

use raftline_core::message::{
    AppendRequest, AppendResponse, Appended, CommandRequest, CommandResponse, Consistency,
    KeepAliveRequest, PublishRequest, PublishResponse, QueryRequest, RegisterRequest, UnregisterRequest, Vote,
    VoteRequest, VoteResponse,
};
use raftline_core::{
    ApplyError, Commit, ConfigError, Delivery, ErrorKind, EventWatermark, Log, LogEntry, MemoryLog,
    NodeError, NodeId, NodeState, Operation, Outbound, QueryContext, RaftConfig, RaftNode, Response,
    SessionId, StateMachine,
};

/// Adds the first byte of each command to a running total and publishes the
/// new total back to the submitting session.
#[derive(Debug, Default)]
struct Counter {
    total: u64,
    applied: Vec<u64>,
}

impl StateMachine for Counter {
    fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, ApplyError> {
        let amount = commit
            .operation()
            .first()
            .copied()
            .ok_or_else(|| ApplyError::new("empty command"))?;
        self.total += amount as u64;
        self.applied.push(commit.sequence());
        commit.publish(self.total.to_be_bytes().to_vec());
        Ok(self.total.to_be_bytes().to_vec())
    }

    fn query(&self, _query: &QueryContext<'_>) -> Result<Vec<u8>, ApplyError> {
        Ok(self.total.to_be_bytes().to_vec())
    }
}

type TestNode = RaftNode<MemoryLog, Counter>;

fn node(id: NodeId, cluster: Vec<NodeId>) -> TestNode {
    RaftNode::new(id, cluster, MemoryLog::new(), Counter::default()).unwrap()
}

fn granted(term: u64) -> VoteResponse {
    Response::Ok(Vote { term, voted: true })
}

fn vote_request(term: u64, candidate: NodeId, last_log_index: u64, last_log_term: u64) -> VoteRequest {
    VoteRequest {
        term,
        candidate,
        last_log_index,
        last_log_term,
    }
}

fn voted(response: &VoteResponse) -> bool {
    response.ok().map(|vote| vote.voted).unwrap_or(false)
}

fn append_request(
    term: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    commit_index: u64,
) -> AppendRequest {
    AppendRequest {
        term,
        leader: 2,
        prev_log_index,
        prev_log_term,
        entries,
        commit_index,
        round: 0,
    }
}

fn appended(response: AppendResponse) -> Appended {
    response.into_result().unwrap()
}

fn noop(term: u64, index: u64) -> LogEntry {
    LogEntry::new(term, index, Operation::NoOp)
}

/// Acknowledge everything in the leader's log on behalf of `peer`, answering
/// the latest broadcast.
fn ack(node: &mut TestNode, peer: NodeId) -> bool {
    let round = node.leader_state().map(|state| state.round).unwrap_or(0);
    ack_round(node, peer, round)
}

fn ack_round(node: &mut TestNode, peer: NodeId, round: u64) -> bool {
    let response = Response::Ok(Appended {
        term: node.current_term,
        succeeded: true,
        last_log_index: node.last_log_index(),
        round,
    });
    node.handle_append_entries_response(peer, response)
}

fn registered_on_three() -> (TestNode, SessionId) {
    let mut node = leader_of_three();
    ack(&mut node, 2);
    let mut registered = node.register(RegisterRequest { client: 7, timeout: 0 });
    ack(&mut node, 2);
    let session = registered.try_recv().unwrap().into_result().unwrap().session;
    (node, session)
}

fn leader_of_three() -> TestNode {
    let mut node = node(1, vec![1, 2, 3]);
    node.start_election();
    assert!(node.handle_vote_response(2, granted(1)));
    node.take_outbound();
    node
}

fn single_leader() -> TestNode {
    let mut node = node(1, vec![1]);
    node.start_election();
    assert_eq!(node.state, NodeState::Leader);
    node
}

fn register(node: &mut TestNode, timeout: u64) -> SessionId {
    let mut response = node.register(RegisterRequest { client: 7, timeout });
    response.try_recv().unwrap().into_result().unwrap().session
}

fn command(session: SessionId, sequence: u64, amount: u8) -> CommandRequest {
    CommandRequest {
        session,
        sequence,
        command: vec![amount],
    }
}

fn total(response: &CommandResponse) -> u64 {
    let output = response.ok().unwrap();
    u64::from_be_bytes(output.result.as_slice().try_into().unwrap())
}

fn published(outbound: Vec<Outbound>) -> Vec<(SessionId, i64)> {
    outbound
        .into_iter()
        .filter_map(|message| match message {
            Outbound::Publish {
                session, response, ..
            } => response.sequence().map(|sequence| (session, sequence)),
            _ => None,
        })
        .collect()
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = node(1, vec![1, 2, 3]);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
        assert!(node.sessions().is_empty());
    }

    #[test]
    fn custom_config_is_applied() {
        let config = RaftConfig {
            election_timeout_min: 200,
            election_timeout_max: 400,
            heartbeat_interval: 100,
            ..RaftConfig::default()
        };
        let node = RaftNode::with_config(1, vec![1, 2, 3], MemoryLog::new(), Counter::default(), config)
            .unwrap();
        assert_eq!(node.config.election_timeout_min, 200);
        assert_eq!(node.config.election_timeout_max, 400);
        assert_eq!(node.config.heartbeat_interval, 100);
    }

    #[test]
    fn inverted_election_range_fails_construction() {
        let config = RaftConfig {
            election_timeout_min: 300,
            election_timeout_max: 150,
            ..RaftConfig::default()
        };
        let result = RaftNode::with_config(1, vec![1, 2, 3], MemoryLog::new(), Counter::default(), config);
        assert!(matches!(
            result,
            Err(NodeError::Config(ConfigError::InvalidElectionRange { min: 300, max: 150 }))
        ));
    }

    #[test]
    fn restart_keeps_term_and_vote() {
        let mut first = node(1, vec![1, 2, 3]);
        first.handle_vote_request(vote_request(3, 2, 0, 0));
        let log = first.log;

        let restarted = RaftNode::new(1, vec![1, 2, 3], log, Counter::default()).unwrap();
        assert_eq!(restarted.current_term, 3);
        assert_eq!(restarted.voted_for, Some(2));
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(node(1, vec![1]).quorum_size(), 1);
        assert_eq!(node(1, vec![1, 2, 3]).quorum_size(), 2);
        assert_eq!(node(1, vec![1, 2, 3, 4]).quorum_size(), 3);
        assert_eq!(node(1, vec![1, 2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn duplicate_vote_responses_dont_count_twice() {
        let mut node = node(1, vec![1, 2, 3, 4, 5]);
        node.start_election();

        node.handle_vote_response(2, granted(1));
        node.handle_vote_response(2, granted(1));

        assert_eq!(node.votes_received.len(), 2);
        assert!(!node.has_quorum());
    }
}

// =============================================================================
// SECTION 3: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn start_election_becomes_candidate() {
        let mut node = node(1, vec![1, 2, 3]);
        let request = node.start_election().unwrap();

        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
        assert_eq!(node.votes_received, vec![1]);
        assert_eq!(request, vote_request(1, 1, 0, 0));
    }

    #[test]
    fn vote_request_includes_log_info() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(2, Operation::NoOp).unwrap();
        node.current_term = 2;

        let request = node.start_election().unwrap();

        assert_eq!(request.last_log_index, 2);
        assert_eq!(request.last_log_term, 2);
    }

    #[test]
    fn majority_vote_wins_election() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        assert!(node.handle_vote_response(2, granted(1)));
        assert_eq!(node.state, NodeState::Leader);
        assert_eq!(node.leader, Some(1));
    }

    #[test]
    fn rejected_votes_dont_count() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        let response = Response::Ok(Vote {
            term: 1,
            voted: false,
        });
        assert!(!node.handle_vote_response(2, response));
        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.votes_received.len(), 1);
    }

    #[test]
    fn stale_vote_response_ignored() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();
        node.start_election();

        assert!(!node.handle_vote_response(2, granted(1)));
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn vote_response_with_higher_term_steps_down() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        node.handle_vote_response(
            2,
            Response::Ok(Vote {
                term: 5,
                voted: false,
            }),
        );

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
    }

    #[test]
    fn single_node_wins_election_immediately() {
        let node = single_leader();
        assert_eq!(node.current_term, 1);
        // the election no-op commits without any peer
        assert_eq!(node.commit_index, 1);
    }
}

// =============================================================================
// SECTION 4: VOTE REQUEST HANDLING TESTS
// =============================================================================

mod vote_requests {
    use super::*;

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut node = node(1, vec![1, 2, 3]);

        let (response, should_reset) = node.handle_vote_request(vote_request(1, 2, 0, 0));

        assert_eq!(response, granted(1));
        assert!(should_reset);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn reject_vote_for_lower_term() {
        let mut node = node(1, vec![1, 2, 3]);
        node.current_term = 5;

        let (response, should_reset) = node.handle_vote_request(vote_request(3, 2, 0, 0));

        assert_eq!(
            response,
            Response::Ok(Vote {
                term: 5,
                voted: false
            })
        );
        assert!(!should_reset);
        assert_eq!(node.current_term, 5);
    }

    #[test]
    fn reject_vote_if_already_voted() {
        let mut node = node(1, vec![1, 2, 3]);
        node.handle_vote_request(vote_request(1, 2, 0, 0));

        let (response, _) = node.handle_vote_request(vote_request(1, 3, 0, 0));
        assert!(!voted(&response));
    }

    #[test]
    fn can_revote_for_same_candidate() {
        let mut node = node(1, vec![1, 2, 3]);
        node.handle_vote_request(vote_request(1, 2, 0, 0));

        let (response, _) = node.handle_vote_request(vote_request(1, 2, 0, 0));
        assert!(voted(&response));
    }

    #[test]
    fn voted_for_resets_on_term_change() {
        let mut node = node(1, vec![1, 2, 3]);
        node.handle_vote_request(vote_request(1, 2, 0, 0));

        let (response, _) = node.handle_vote_request(vote_request(2, 3, 0, 0));

        assert!(voted(&response));
        assert_eq!(node.voted_for, Some(3));
    }

    #[test]
    fn reject_candidate_with_stale_log() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(5, Operation::NoOp).unwrap();
        node.current_term = 5;

        let (response, _) = node.handle_vote_request(vote_request(5, 2, 1, 3));
        assert!(!voted(&response));
    }

    #[test]
    fn reject_candidate_with_shorter_log_same_term() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(1, Operation::NoOp).unwrap();
        node.current_term = 1;

        let (response, _) = node.handle_vote_request(vote_request(1, 2, 1, 1));
        assert!(!voted(&response));
    }

    #[test]
    fn leader_steps_down_and_votes_on_higher_term() {
        let (mut node, session) = registered_on_three();
        let mut appended = node.command(command(session, 1, 1));
        let mut held = node.command(command(session, 3, 1));
        let term = node.current_term;
        let request = vote_request(term + 1, 3, node.last_log_index(), node.last_log_term());

        let (response, should_reset) = node.handle_vote_request(request);

        assert_eq!(response, granted(term + 1));
        assert!(should_reset);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, term + 1);
        assert_eq!(node.voted_for, Some(3));
        assert!(node.leader_state().is_none());
        assert_eq!(appended.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
        assert_eq!(held.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }

    #[test]
    fn candidate_steps_down_and_votes_on_higher_term() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        let (response, _) = node.handle_vote_request(vote_request(2, 3, 0, 0));

        assert_eq!(response, granted(2));
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.voted_for, Some(3));
        assert!(node.votes_received.is_empty());
    }

    #[test]
    fn grant_vote_to_candidate_with_higher_term_log() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(1, Operation::NoOp).unwrap();
        node.current_term = 2;

        let (response, _) = node.handle_vote_request(vote_request(2, 2, 1, 2));
        assert!(voted(&response));
    }
}

// =============================================================================
// SECTION 5: LEADER STATE MANAGEMENT
// =============================================================================

mod leader_state {
    use super::*;

    #[test]
    fn become_leader_appends_noop_for_its_term() {
        let node = leader_of_three();
        assert_eq!(node.get_entry(1), Some(noop(1, 1)));
        assert_eq!(node.leader_state().unwrap().noop_index, 1);
    }

    #[test]
    fn become_leader_initializes_indexes() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.current_term = 1;
        node.start_election();
        node.handle_vote_response(2, granted(2));

        let leader_state = node.leader_state().unwrap();
        assert_eq!(leader_state.next_index.get(&2), Some(&2));
        assert_eq!(leader_state.next_index.get(&3), Some(&2));
        assert_eq!(leader_state.match_index.get(&2), Some(&0));
        assert!(node.votes_received.is_empty());
    }

    #[test]
    fn become_leader_sends_append_to_every_peer() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();
        node.take_outbound();
        node.handle_vote_response(2, granted(1));

        let targets: Vec<NodeId> = node
            .take_outbound()
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Append { to, request } => {
                    assert_eq!(request.entries, vec![noop(1, 1)]);
                    Some(to)
                }
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![2, 3]);
    }

    #[test]
    fn become_follower_clears_election_state() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        node.become_follower(5);

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
        assert!(node.votes_received.is_empty());
        assert!(node.leader_state().is_none());
    }
}

// =============================================================================
// SECTION 6: APPEND ENTRIES HANDLING TESTS
// =============================================================================

mod append_entries_handling {
    use super::*;

    #[test]
    fn reject_append_entries_with_lower_term() {
        let mut node = node(1, vec![1, 2, 3]);
        node.current_term = 5;

        let (response, should_reset) = node.handle_append_entries(append_request(3, 0, 0, vec![], 0));

        let appended = appended(response);
        assert_eq!(appended.term, 5);
        assert!(!appended.succeeded);
        assert!(!should_reset);
    }

    #[test]
    fn accept_heartbeat_from_valid_leader() {
        let mut node = node(1, vec![1, 2, 3]);

        let (response, should_reset) = node.handle_append_entries(append_request(1, 0, 0, vec![], 0));

        assert!(appended(response).succeeded);
        assert!(should_reset);
        assert_eq!(node.leader, Some(2));
        assert_eq!(node.current_term, 1);
    }

    #[test]
    fn candidate_steps_down_on_append_entries() {
        let mut node = node(1, vec![1, 2, 3]);
        node.start_election();

        node.handle_append_entries(append_request(1, 0, 0, vec![], 0));

        assert_eq!(node.state, NodeState::Follower);
    }

    #[test]
    fn missing_prev_entry_hints_our_last_index() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();

        let (response, _) = node.handle_append_entries(append_request(1, 5, 1, vec![], 0));

        let appended = appended(response);
        assert!(!appended.succeeded);
        assert_eq!(appended.last_log_index, 1);
    }

    #[test]
    fn mismatched_prev_term_hints_index_before_it() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(1, Operation::NoOp).unwrap();

        let (response, _) = node.handle_append_entries(append_request(3, 2, 3, vec![], 0));

        let appended = appended(response);
        assert!(!appended.succeeded);
        assert_eq!(appended.last_log_index, 1);
    }

    #[test]
    fn append_entries_adds_new_entries() {
        let mut node = node(1, vec![1, 2, 3]);

        let (response, _) =
            node.handle_append_entries(append_request(1, 0, 0, vec![noop(1, 1), noop(1, 2)], 0));

        assert_eq!(appended(response).last_log_index, 2);
        assert_eq!(node.log.len(), 2);
        assert_eq!(node.get_entry(2), Some(noop(1, 2)));
    }

    #[test]
    fn append_entries_truncates_conflicting_entries() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(1, Operation::NoOp).unwrap();
        node.log.append(1, Operation::NoOp).unwrap();

        node.handle_append_entries(append_request(2, 1, 1, vec![noop(2, 2)], 0));

        assert_eq!(node.log.len(), 2);
        assert_eq!(node.get_term_at(2), 2);
    }

    #[test]
    fn repeated_append_is_idempotent() {
        let mut node = node(1, vec![1, 2, 3]);
        let request = append_request(1, 0, 0, vec![noop(1, 1), noop(1, 2)], 0);

        node.handle_append_entries(request.clone());
        node.handle_append_entries(request);

        assert_eq!(node.log.len(), 2);
    }

    #[test]
    fn commit_index_capped_at_last_new_entry() {
        let mut node = node(1, vec![1, 2, 3]);

        node.handle_append_entries(append_request(1, 0, 0, vec![noop(1, 1)], 100));

        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    #[test]
    fn commit_index_never_decreases() {
        let mut node = node(1, vec![1, 2, 3]);
        node.handle_append_entries(append_request(1, 0, 0, vec![noop(1, 1), noop(1, 2)], 2));

        node.handle_append_entries(append_request(1, 2, 1, vec![], 1));

        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn conflict_with_committed_entry_is_a_protocol_error() {
        let mut node = node(1, vec![1, 2, 3]);
        node.handle_append_entries(append_request(1, 0, 0, vec![noop(1, 1), noop(1, 2)], 2));

        let (response, _) = node.handle_append_entries(append_request(2, 0, 0, vec![noop(2, 1)], 2));

        assert_eq!(response, Response::Error(ErrorKind::ProtocolError));
        assert_eq!(node.get_term_at(1), 1);
    }
}

// =============================================================================
// SECTION 7: APPEND ENTRIES RESPONSE HANDLING
// =============================================================================

mod append_entries_response {
    use super::*;

    #[test]
    fn success_response_updates_match_index() {
        let mut node = leader_of_three();

        ack(&mut node, 2);

        let leader_state = node.leader_state().unwrap();
        assert_eq!(leader_state.match_index.get(&2), Some(&1));
        assert_eq!(leader_state.next_index.get(&2), Some(&2));
    }

    #[test]
    fn failure_response_backs_off_to_hint() {
        let mut node = node(1, vec![1, 2, 3]);
        for _ in 0..3 {
            node.log.append(1, Operation::NoOp).unwrap();
        }
        node.current_term = 1;
        node.start_election();
        node.handle_vote_response(2, granted(2));
        node.take_outbound();

        let response = Response::Ok(Appended {
            term: 2,
            succeeded: false,
            last_log_index: 1,
            round: 1,
        });
        node.handle_append_entries_response(2, response);

        assert_eq!(node.leader_state().unwrap().next_index.get(&2), Some(&2));
        let retries: Vec<u64> = node
            .take_outbound()
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Append { to: 2, request } => Some(request.prev_log_index),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1]);
    }

    #[test]
    fn higher_term_response_causes_step_down() {
        let mut node = leader_of_three();

        node.handle_append_entries_response(
            2,
            Response::Ok(Appended {
                term: 5,
                succeeded: false,
                last_log_index: 0,
                round: 1,
            }),
        );

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
    }

    #[test]
    fn non_leader_ignores_append_entries_response() {
        let mut node = node(1, vec![1, 2, 3]);
        assert!(!ack(&mut node, 2));
    }
}

// =============================================================================
// SECTION 8: COMMIT INDEX ADVANCEMENT
// =============================================================================

mod commit_advancement {
    use super::*;

    #[test]
    fn commit_on_majority_replication() {
        let mut node = leader_of_three();

        assert!(ack(&mut node, 2));
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    #[test]
    fn no_commit_without_quorum() {
        let mut node = node(1, vec![1, 2, 3, 4, 5]);
        node.start_election();
        node.handle_vote_response(2, granted(1));
        node.handle_vote_response(3, granted(1));

        assert!(!ack(&mut node, 2));
        assert_eq!(node.commit_index, 0);
    }

    #[test]
    fn previous_term_entries_commit_only_with_current_term() {
        let mut node = node(1, vec![1, 2, 3]);
        node.log.append(1, Operation::NoOp).unwrap();
        node.current_term = 1;
        node.start_election();
        node.handle_vote_response(2, granted(2));

        // peer holds only the old entry: counted, but not committable on its own
        node.handle_append_entries_response(
            2,
            Response::Ok(Appended {
                term: 2,
                succeeded: true,
                last_log_index: 1,
                round: 1,
            }),
        );
        assert_eq!(node.commit_index, 0);

        ack(&mut node, 2);
        assert_eq!(node.commit_index, 2);
        assert_eq!(node.last_applied, 2);
    }
}

// =============================================================================
// SECTION 9: SESSIONS
// =============================================================================

mod sessions {
    use super::*;

    #[test]
    fn session_id_is_register_entry_index() {
        let mut node = single_leader();
        let mut response = node.register(RegisterRequest { client: 7, timeout: 0 });

        let registered = response.try_recv().unwrap().into_result().unwrap();
        assert_eq!(registered.session, 2);
        assert_eq!(registered.leader, 1);
        assert_eq!(registered.members, vec![1]);
        assert_eq!(registered.timeout, RaftConfig::default().session_timeout);
    }

    #[test]
    fn register_on_follower_reports_no_leader() {
        let mut node = node(1, vec![1, 2, 3]);
        let mut response = node.register(RegisterRequest { client: 7, timeout: 0 });
        assert_eq!(response.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }

    #[test]
    fn sessions_expire_by_entry_timestamp() {
        let mut node = single_leader();
        let first = register(&mut node, 100);

        node.set_time(1_000);
        let second = register(&mut node, 100);

        assert!(!node.sessions().contains(first));
        assert!(node.sessions().contains(second));

        let mut response = node.command(command(first, 1, 1));
        assert_eq!(
            response.try_recv().unwrap(),
            Response::Error(ErrorKind::UnknownSession)
        );
    }

    #[test]
    fn expiry_fails_held_commands() {
        let mut node = single_leader();
        let session = register(&mut node, 100);
        let mut held = node.command(command(session, 3, 1));

        node.set_time(1_000);
        register(&mut node, 100);

        assert_eq!(
            held.try_recv().unwrap(),
            Response::Error(ErrorKind::UnknownSession)
        );
    }

    #[test]
    fn keep_alive_refreshes_session() {
        let mut node = single_leader();
        let session = register(&mut node, 100);

        node.set_time(80);
        let mut kept = node.keep_alive(KeepAliveRequest {
            session,
            command_sequence: 0,
            event_sequence: 0,
        });
        assert!(kept.try_recv().unwrap().is_ok());

        node.set_time(150);
        register(&mut node, 100);
        assert!(node.sessions().contains(session));
    }

    #[test]
    fn keep_alive_for_unknown_session_is_rejected() {
        let mut node = single_leader();
        let mut kept = node.keep_alive(KeepAliveRequest {
            session: 42,
            command_sequence: 0,
            event_sequence: 0,
        });
        assert_eq!(kept.try_recv().unwrap(), Response::Error(ErrorKind::UnknownSession));
    }

    #[test]
    fn unregister_closes_session() {
        let mut node = single_leader();
        let session = register(&mut node, 0);

        let mut closed = node.unregister(UnregisterRequest { session });
        assert_eq!(closed.try_recv().unwrap(), Response::Ok(()));
        assert!(!node.sessions().contains(session));

        let mut response = node.command(command(session, 1, 1));
        assert_eq!(
            response.try_recv().unwrap(),
            Response::Error(ErrorKind::UnknownSession)
        );
    }
}

// =============================================================================
// SECTION 10: COMMAND SEQUENCING
// =============================================================================

mod command_sequencing {
    use super::*;

    #[test]
    fn out_of_order_commands_apply_in_sequence() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        let before = node.last_log_index();

        let mut second = node.command(command(session, 2, 20));
        let mut third = node.command(command(session, 3, 30));
        // nothing can be appended until sequence 1 shows up
        assert_eq!(node.last_log_index(), before);
        assert!(second.try_recv().is_err());

        let mut first = node.command(command(session, 1, 10));

        assert_eq!(node.state_machine().applied, vec![1, 2, 3]);
        assert_eq!(total(&first.try_recv().unwrap()), 10);
        assert_eq!(total(&second.try_recv().unwrap()), 30);
        assert_eq!(total(&third.try_recv().unwrap()), 60);

        let sequences: Vec<u64> = (before + 1..=node.last_log_index())
            .filter_map(|index| match node.get_entry(index)?.operation {
                Operation::Command { sequence, .. } => Some(sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn applied_duplicate_is_answered_from_cache() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        let mut original = node.command(command(session, 1, 5));
        let original = original.try_recv().unwrap();
        let last_index = node.last_log_index();

        let mut retry = node.command(command(session, 1, 5));

        assert_eq!(retry.try_recv().unwrap(), original);
        assert_eq!(node.last_log_index(), last_index);
        assert_eq!(node.state_machine().applied, vec![1]);
    }

    #[test]
    fn released_duplicate_reports_command_error() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.command(command(session, 1, 5));
        node.keep_alive(KeepAliveRequest {
            session,
            command_sequence: 1,
            event_sequence: 0,
        });

        let mut retry = node.command(command(session, 1, 5));
        assert_eq!(retry.try_recv().unwrap(), Response::Error(ErrorKind::CommandError));
        assert_eq!(node.state_machine().applied, vec![1]);
    }

    #[test]
    fn in_flight_retry_shares_the_entry() {
        let mut node = leader_of_three();
        ack(&mut node, 2);
        let mut registered = node.register(RegisterRequest { client: 7, timeout: 0 });
        ack(&mut node, 2);
        let session = registered.try_recv().unwrap().into_result().unwrap().session;

        let mut first = node.command(command(session, 1, 5));
        let last_index = node.last_log_index();
        let mut retry = node.command(command(session, 1, 5));
        assert_eq!(node.last_log_index(), last_index);

        ack(&mut node, 2);

        let first = first.try_recv().unwrap();
        assert_eq!(retry.try_recv().unwrap(), first);
        assert_eq!(total(&first), 5);
        assert_eq!(node.state_machine().applied, vec![1]);
    }

    #[test]
    fn application_error_is_returned_to_the_caller() {
        let mut node = single_leader();
        let session = register(&mut node, 0);

        let mut failed = node.command(CommandRequest {
            session,
            sequence: 1,
            command: vec![],
        });
        let mut next = node.command(command(session, 2, 3));

        assert_eq!(
            failed.try_recv().unwrap(),
            Response::Error(ErrorKind::ApplicationError)
        );
        assert_eq!(total(&next.try_recv().unwrap()), 3);
    }

    #[test]
    fn command_on_follower_reports_no_leader() {
        let mut node = node(1, vec![1, 2, 3]);
        let mut response = node.command(command(1, 1, 1));
        assert_eq!(response.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }
}

// =============================================================================
// SECTION 11: QUERIES
// =============================================================================

mod queries {
    use super::*;

    fn query(session: SessionId, index: u64, consistency: Consistency) -> QueryRequest {
        QueryRequest {
            session,
            index,
            consistency,
            query: b"total".to_vec(),
        }
    }

    #[test]
    fn sequential_query_reads_applied_state() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.command(command(session, 1, 9));

        let mut response = node.query(query(session, 0, Consistency::Sequential));

        let output = response.try_recv().unwrap().into_result().unwrap();
        assert_eq!(output.result, 9u64.to_be_bytes().to_vec());
        assert_eq!(output.index, node.last_applied);
    }

    #[test]
    fn query_waits_for_requested_index() {
        let mut node = leader_of_three();
        ack(&mut node, 2);
        let mut registered = node.register(RegisterRequest { client: 7, timeout: 0 });
        ack(&mut node, 2);
        let session = registered.try_recv().unwrap().into_result().unwrap().session;
        node.command(command(session, 1, 4));
        let index = node.last_log_index();

        let mut response = node.query(query(session, index, Consistency::Linearizable));
        assert!(response.try_recv().is_err());

        ack(&mut node, 2);
        let output = response.try_recv().unwrap().into_result().unwrap();
        assert_eq!(output.result, 4u64.to_be_bytes().to_vec());
    }

    #[test]
    fn linearizable_query_waits_for_a_quorum_to_confirm_leadership() {
        let (mut node, session) = registered_on_three();
        node.take_outbound();
        let before = node.leader_state().unwrap().round;

        let mut response = node.query(query(session, 0, Consistency::Linearizable));
        assert!(response.try_recv().is_err());

        let round = node.leader_state().unwrap().round;
        assert_eq!(round, before + 1);
        let confirmations: Vec<NodeId> = node
            .take_outbound()
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Append { to, request } if request.round == round => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(confirmations, vec![2, 3]);

        // an answer to an earlier broadcast says nothing about leadership now
        ack_round(&mut node, 2, before);
        assert!(response.try_recv().is_err());

        ack(&mut node, 3);
        let output = response.try_recv().unwrap().into_result().unwrap();
        assert_eq!(output.index, node.last_applied);
    }

    #[test]
    fn deposed_leader_never_answers_linearizable_query() {
        let (mut node, session) = registered_on_three();
        let mut response = node.query(query(session, 0, Consistency::Linearizable));

        node.handle_append_entries(append_request(node.current_term + 1, 0, 0, vec![], 0));

        assert_eq!(response.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }

    #[test]
    fn linearizable_query_on_follower_reports_no_leader() {
        let mut node = node(1, vec![1, 2, 3]);
        let mut response = node.query(query(1, 0, Consistency::Linearizable));
        assert_eq!(response.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }

    #[test]
    fn query_for_unknown_session_is_rejected() {
        let mut node = single_leader();
        let mut response = node.query(query(42, 0, Consistency::Sequential));
        assert_eq!(
            response.try_recv().unwrap(),
            Response::Error(ErrorKind::UnknownSession)
        );
    }
}

// =============================================================================
// SECTION 12: EVENTS
// =============================================================================

mod events {
    use super::*;

    #[test]
    fn committed_events_are_published_in_order() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.take_outbound();

        node.command(command(session, 1, 1));
        node.command(command(session, 2, 1));

        assert_eq!(published(node.take_outbound()), vec![(session, 1), (session, 2)]);
    }

    #[test]
    fn publish_ack_moves_the_watermark() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.command(command(session, 1, 1));
        node.command(command(session, 2, 1));

        let response = node.publish(PublishRequest {
            session,
            event_sequence: 1,
        });

        assert_eq!(response.sequence(), Some(1));
        assert_eq!(response.version(), Some(1));
        let record = node.sessions().get(session).unwrap();
        assert_eq!(record.event_ack(), 1);
        assert_eq!(record.pending_events().count(), 1);
    }

    #[test]
    fn keep_alive_behind_the_sent_events_triggers_resend() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.command(command(session, 1, 1));
        node.take_outbound();

        node.keep_alive(KeepAliveRequest {
            session,
            command_sequence: 1,
            event_sequence: 0,
        });

        assert_eq!(published(node.take_outbound()), vec![(session, 1)]);
    }

    #[test]
    fn step_up_resends_unacknowledged_events() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.command(command(session, 1, 1));
        node.command(command(session, 2, 1));
        node.publish(PublishRequest {
            session,
            event_sequence: 1,
        });

        let mut watermark = EventWatermark::new();
        let mut delivered = Vec::new();
        for message in node.take_outbound() {
            if let Outbound::Publish { response, .. } = message {
                if watermark.accept(&response) == Delivery::Accepted {
                    delivered.push(response.sequence());
                }
            }
        }

        node.become_follower(node.current_term + 1);
        node.start_election();
        let resent = published(node.take_outbound());
        assert_eq!(resent, vec![(session, 2)]);

        // the client already has sequence 2
        let replay = PublishResponse::publish_ok(2, 2).unwrap();
        assert_eq!(watermark.accept(&replay), Delivery::Duplicate);
        assert_eq!(delivered, vec![Some(1), Some(2)]);
    }

    fn deliveries(outbound: Vec<Outbound>) -> Vec<PublishResponse> {
        outbound
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Publish { response, .. } => Some(response),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lost_event_is_resent_after_the_client_reports_a_gap() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        node.take_outbound();
        for sequence in 1..=3 {
            node.command(command(session, sequence, 1));
        }
        let mut sent = deliveries(node.take_outbound());
        // event 2 never reaches the client
        sent.remove(1);

        let mut watermark = EventWatermark::new();
        assert_eq!(watermark.accept(&sent[0]), Delivery::Accepted);
        node.publish(PublishRequest {
            session,
            event_sequence: watermark.sequence(),
        });
        assert!(published(node.take_outbound()).is_empty());

        assert_eq!(watermark.accept(&sent[1]), Delivery::Gap);
        node.publish(PublishRequest {
            session,
            event_sequence: watermark.sequence(),
        });

        let resent = deliveries(node.take_outbound());
        let sequences: Vec<Option<i64>> = resent.iter().map(|response| response.sequence()).collect();
        assert_eq!(sequences, vec![Some(2), Some(3)]);
        for response in &resent {
            assert_eq!(watermark.accept(response), Delivery::Accepted);
        }
        assert_eq!(watermark.sequence(), 3);
        assert_eq!(node.sessions().get(session).unwrap().event_ack(), 1);
    }

    #[test]
    fn advancing_ack_does_not_resend_events_in_flight() {
        let mut node = single_leader();
        let session = register(&mut node, 0);
        for sequence in 1..=4 {
            node.command(command(session, sequence, 1));
        }
        node.take_outbound();

        for acked in 1..=3 {
            let response = node.publish(PublishRequest {
                session,
                event_sequence: acked,
            });
            assert_eq!(response.sequence(), Some(acked));
            assert!(published(node.take_outbound()).is_empty());
        }
    }

    #[test]
    fn publish_on_follower_reports_no_leader() {
        let mut node = node(1, vec![1, 2, 3]);
        let response = node.publish(PublishRequest {
            session: 1,
            event_sequence: 0,
        });
        assert_eq!(response, Response::Error(ErrorKind::NoLeader));
    }
}

// =============================================================================
// SECTION 13: STEP-DOWN
// =============================================================================

mod step_down {
    use super::*;

    #[test]
    fn pending_commands_fail_with_no_leader() {
        let mut node = leader_of_three();
        ack(&mut node, 2);
        let mut registered = node.register(RegisterRequest { client: 7, timeout: 0 });
        ack(&mut node, 2);
        let session = registered.try_recv().unwrap().into_result().unwrap().session;

        let mut appended = node.command(command(session, 1, 1));
        let mut held = node.command(command(session, 3, 1));

        node.handle_append_entries(append_request(5, 0, 0, vec![], 0));

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(appended.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
        assert_eq!(held.try_recv().unwrap(), Response::Error(ErrorKind::NoLeader));
    }

    #[test]
    fn shutdown_fails_everything_pending() {
        let mut node = leader_of_three();
        let mut registered = node.register(RegisterRequest { client: 7, timeout: 0 });

        node.shutdown();

        assert_eq!(
            registered.try_recv().unwrap(),
            Response::Error(ErrorKind::NoLeader)
        );
    }

    #[test]
    fn term_never_decreases() {
        let mut node = node(1, vec![1, 2, 3]);
        node.current_term = 10;

        node.handle_vote_request(vote_request(5, 2, 0, 0));
        node.handle_append_entries(append_request(5, 0, 0, vec![], 0));

        assert_eq!(node.current_term, 10);
    }
}
