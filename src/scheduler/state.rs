//! The scheduler matches compile requests to free workers whose network the
//! requesting client can reach, queues requests when nothing is free and
//! drains the queue whenever capacity may have appeared.

use std::time::SystemTime;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::common::{Map, WrappedRcRefCell};
use crate::machine::{MachineId, MachineName, RequestId};
use crate::net::{get_matching_ip, sort_private_first, CidrAddr};
use crate::protocol::messages::{
    CompletedJob, RequestInfo, ServerStateInfo, WorkerAllocation, WorkerResponse, WorkerState,
};

/// A pending ask for a worker. Responses are pushed into `sink`: any number
/// of `Queued`, then one terminal `Valid` (or a lone `NoWorkers`).
pub struct SchedulerRequest {
    pub guid: RequestId,
    addrs: Vec<CidrAddr>,
    sink: UnboundedSender<WorkerResponse>,
    active: bool,
    info: RequestInfo,
}

impl SchedulerRequest {
    pub fn new(
        requester: MachineName,
        addrs: Vec<CidrAddr>,
    ) -> (SchedulerRequest, UnboundedReceiver<WorkerResponse>) {
        let (sink, receiver) = unbounded_channel();
        let request = SchedulerRequest {
            guid: RequestId::new(),
            addrs,
            sink,
            active: true,
            info: RequestInfo {
                requester,
                enqueued_at: SystemTime::now(),
            },
        };
        (request, receiver)
    }
}

pub struct Scheduler {
    /// All currently active workers, keyed by machine id.
    workers: Map<MachineId, WorkerState>,
    /// Waiting requests, in arrival order.
    requests: Vec<SchedulerRequest>,
}

pub type SchedulerRef = WrappedRcRefCell<Scheduler>;

impl SchedulerRef {
    pub fn new() -> SchedulerRef {
        WrappedRcRefCell::wrap(Scheduler::default())
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler {
            workers: Map::new(),
            requests: Vec::new(),
        }
    }
}

impl Scheduler {
    /// Puts in a request for a worker. With no workers at all the sink gets
    /// `NoWorkers` immediately; a request carrying no addresses can never
    /// match anything and is rejected instead of queued forever.
    pub fn schedule(&mut self, mut request: SchedulerRequest) -> crate::Result<()> {
        debug_assert!(request.active);

        if self.workers.is_empty() {
            let _ = request.sink.send(WorkerResponse::NoWorkers);
            return Ok(());
        }

        if request.addrs.is_empty() {
            return Err(crate::Error::NoSourceAddresses);
        }

        sort_private_first(&mut request.addrs);

        match find_free_worker(&self.workers, &request.addrs) {
            Ok(allocation) => {
                let _ = request.sink.send(WorkerResponse::Valid(allocation));
            }
            Err(_) => {
                let _ = request.sink.send(WorkerResponse::Queued);
                self.requests.push(request);
            }
        }
        Ok(())
    }

    /// Removes the request from the queue. A cancellation racing with a
    /// successful match is benign, the match lands in a dead sink.
    pub fn cancel(&mut self, guid: RequestId) -> crate::Result<()> {
        match self.requests.iter().position(|r| r.guid == guid) {
            Some(found) => {
                self.requests[found].active = false;
                self.requests.remove(found);
                Ok(())
            }
            None => Err(crate::Error::RequestNotFound(guid)),
        }
    }

    /// Blends the speed of a finished job into the worker's estimate with
    /// New = Old * 0.9 + Update * 0.1 to smooth out spikes.
    pub fn completed(&mut self, cj: &CompletedJob) -> crate::Result<()> {
        let state = self
            .workers
            .get_mut(&cj.worker.id)
            .ok_or_else(|| crate::Error::WorkerNotFound(cj.worker.id.clone()))?;

        if state.speed == 0.0 {
            state.speed = cj.compile_speed;
        } else {
            state.speed = state.speed * 0.9 + cj.compile_speed * 0.1;
        }
        Ok(())
    }

    pub fn add_worker(&mut self, mut state: WorkerState) {
        self.normalize(&mut state);
        log::debug!("Adding worker {}[{}]", state.host, state.id);
        self.workers.insert(state.id.clone(), state);
        self.schedule_requests();
    }

    /// Merges a state push into the existing entry. The speed estimate is
    /// owned by the scheduler and survives the merge.
    pub fn update_worker(&mut self, mut state: WorkerState) {
        self.normalize(&mut state);
        if let Some(existing) = self.workers.get(&state.id) {
            state.speed = existing.speed;
        }
        self.workers.insert(state.id.clone(), state);
        self.schedule_requests();
    }

    pub fn remove_worker(&mut self, id: &MachineId) {
        if self.workers.remove(id).is_none() {
            log::debug!("Removing unknown worker {}", id);
        }
    }

    pub fn state_info(&self) -> ServerStateInfo {
        ServerStateInfo {
            workers: self.workers.values().cloned().collect(),
            requests: self.requests.iter().map(|r| r.info.clone()).collect(),
        }
    }

    /// Stamp with our local clock so worker clocks never need to agree with
    /// ours, and order addresses so LAN matches win.
    fn normalize(&self, state: &mut WorkerState) {
        state.updated = SystemTime::now();
        sort_private_first(&mut state.addrs);
    }

    /// Fulfills queued requests until a whole pass matches nothing.
    fn schedule_requests(&mut self) {
        loop {
            let mut found = None;

            for (idx, request) in self.requests.iter().enumerate() {
                if let Ok(allocation) = find_free_worker(&self.workers, &request.addrs) {
                    let _ = request.sink.send(WorkerResponse::Valid(allocation));
                    found = Some(idx);
                    break;
                }
            }

            match found {
                Some(idx) => {
                    self.requests.remove(idx);
                }
                None => break,
            }
        }
    }
}

/// Finds a free worker reachable from any of the given client networks,
/// preferring the fastest candidate.
pub(crate) fn find_free_worker(
    workers: &Map<MachineId, WorkerState>,
    addrs: &[CidrAddr],
) -> crate::Result<WorkerAllocation> {
    if addrs.is_empty() {
        return Err(crate::Error::NoSourceAddresses);
    }

    let mut found: Option<(&WorkerState, CidrAddr)> = None;

    for state in workers.values() {
        let space = state.capacity.saturating_sub(state.load);
        if space == 0 {
            continue;
        }
        if let Some(addr) = get_matching_ip(addrs, &state.addrs) {
            let faster = match &found {
                Some((best, _)) => best.speed < state.speed,
                None => true,
            };
            if faster {
                found = Some((state, addr));
            }
        }
    }

    match found {
        Some((worker, address)) => Ok(WorkerAllocation {
            id: worker.id.clone(),
            host: worker.host.clone(),
            address,
            port: worker.port,
        }),
        None => Err(crate::Error::NoReachableWorker),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{find_free_worker, Scheduler, SchedulerRequest};
    use crate::machine::{MachineId, MachineName, RequestId};
    use crate::net::CidrAddr;
    use crate::protocol::messages::{CompletedJob, WorkerResponse, WorkerState};

    fn cidr(a: u8, b: u8, c: u8, d: u8) -> CidrAddr {
        CidrAddr::new(Ipv4Addr::new(a, b, c, d), 24)
    }

    fn worker(id: &str, addr: CidrAddr, capacity: u32, load: u32) -> WorkerState {
        WorkerState {
            id: MachineId::new(id),
            host: id.to_string(),
            addrs: vec![addr],
            port: 56,
            capacity,
            load,
            updated: SystemTime::now(),
            speed: 0.0,
        }
    }

    fn request(addrs: Vec<CidrAddr>) -> (SchedulerRequest, UnboundedReceiver<WorkerResponse>) {
        SchedulerRequest::new(
            MachineName {
                id: MachineId::new("client"),
                host: "client".to_string(),
            },
            addrs,
        )
    }

    fn completed(worker_id: &str, speed: f64) -> CompletedJob {
        CompletedJob {
            client: MachineName::default(),
            worker: MachineName {
                id: MachineId::new(worker_id),
                host: worker_id.to_string(),
            },
            input_size: 0,
            output_size: 0,
            compile_time: Duration::from_secs(1),
            compile_speed: speed,
        }
    }

    #[test]
    fn no_workers_at_all() {
        let mut scheduler = Scheduler::default();
        let (req, mut rx) = request(vec![cidr(192, 168, 1, 3)]);
        scheduler.schedule(req).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkerResponse::NoWorkers);
    }

    #[test]
    fn empty_source_addresses_never_map_to_no_workers() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 5, 0));

        let (req, mut rx) = request(Vec::new());
        match scheduler.schedule(req) {
            Err(crate::Error::NoSourceAddresses) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn busy_workers_queue_the_request() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("bar", cidr(192, 168, 1, 1), 5, 5));
        scheduler.add_worker(worker("foo", cidr(192, 168, 1, 2), 3, 3));

        let (req, mut rx) = request(vec![cidr(192, 168, 1, 3)]);
        scheduler.schedule(req).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkerResponse::Queued);

        // Freeing a worker drains the queue into the same sink
        scheduler.update_worker(worker("foo", cidr(192, 168, 1, 2), 3, 0));
        match rx.try_recv().unwrap() {
            WorkerResponse::Valid(allocation) => {
                assert_eq!(allocation.id, MachineId::new("foo"));
                assert_eq!(allocation.host, "foo");
                assert_eq!(allocation.address, cidr(192, 168, 1, 2));
                assert_eq!(allocation.port, 56);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn unreachable_workers_are_filtered() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("far", cidr(10, 0, 0, 1), 1, 0));

        let (req, mut rx) = request(vec![cidr(192, 168, 1, 3)]);
        scheduler.schedule(req).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkerResponse::Queued);

        match find_free_worker(&scheduler.workers, &[cidr(192, 168, 1, 3)]) {
            Err(crate::Error::NoReachableWorker) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn fastest_reachable_worker_wins() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 1, 0));
        let mut speedy = worker("b", cidr(192, 168, 1, 2), 1, 0);
        speedy.speed = 5.0;
        scheduler.add_worker(speedy);

        let (req, mut rx) = request(vec![cidr(192, 168, 1, 3)]);
        scheduler.schedule(req).unwrap();
        match rx.try_recv().unwrap() {
            WorkerResponse::Valid(allocation) => assert_eq!(allocation.id, MachineId::new("b")),
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn completed_jobs_blend_speed() {
        let mut scheduler = Scheduler::default();
        let mut speedy = worker("b", cidr(192, 168, 1, 2), 1, 0);
        speedy.speed = 5.0;
        scheduler.add_worker(speedy);

        scheduler.completed(&completed("b", 15.0)).unwrap();
        let speed = scheduler.workers[&MachineId::new("b")].speed;
        assert!((speed - 6.0).abs() < 1e-9, "speed was {}", speed);

        // A worker with no estimate yet takes the first observation as-is
        scheduler.add_worker(worker("c", cidr(192, 168, 1, 4), 1, 0));
        scheduler.completed(&completed("c", 7.0)).unwrap();
        assert_eq!(scheduler.workers[&MachineId::new("c")].speed, 7.0);

        match scheduler.completed(&completed("nope", 1.0)) {
            Err(crate::Error::WorkerNotFound(_)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn updates_preserve_scheduler_owned_speed() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 4, 0));
        scheduler.completed(&completed("a", 10.0)).unwrap();

        let mut update = worker("a", cidr(192, 168, 1, 1), 4, 2);
        update.speed = 999.0;
        scheduler.update_worker(update);

        let state = &scheduler.workers[&MachineId::new("a")];
        assert_eq!(state.speed, 10.0);
        assert_eq!(state.load, 2);
    }

    #[test]
    fn cancel_removes_queued_request() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 1, 1));

        let (req, mut rx) = request(vec![cidr(192, 168, 1, 3)]);
        let guid = req.guid;
        scheduler.schedule(req).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkerResponse::Queued);

        scheduler.cancel(guid).unwrap();
        assert!(scheduler.state_info().requests.is_empty());

        match scheduler.cancel(RequestId::new()) {
            Err(crate::Error::RequestNotFound(_)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }

        // The canceled request never hears back
        scheduler.update_worker(worker("a", cidr(192, 168, 1, 1), 1, 0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queue_drain_reaches_a_fixed_point() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 2, 2));

        let (req1, mut rx1) = request(vec![cidr(192, 168, 1, 3)]);
        let (req2, mut rx2) = request(vec![cidr(192, 168, 1, 4)]);
        scheduler.schedule(req1).unwrap();
        scheduler.schedule(req2).unwrap();
        assert_eq!(rx1.try_recv().unwrap(), WorkerResponse::Queued);
        assert_eq!(rx2.try_recv().unwrap(), WorkerResponse::Queued);

        // Repeated updates without free capacity match nothing
        scheduler.update_worker(worker("a", cidr(192, 168, 1, 1), 2, 2));
        scheduler.update_worker(worker("a", cidr(192, 168, 1, 1), 2, 2));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert_eq!(scheduler.state_info().requests.len(), 2);

        // Capacity frees and the queue drains in FIFO order
        scheduler.update_worker(worker("a", cidr(192, 168, 1, 1), 2, 0));
        assert!(matches!(
            rx1.try_recv().unwrap(),
            WorkerResponse::Valid(_)
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            WorkerResponse::Valid(_)
        ));
        assert!(scheduler.state_info().requests.is_empty());
    }

    #[test]
    fn random_operation_sequences_keep_invariants() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let ids = ["a", "b", "c", "d"];
        let nets: Vec<CidrAddr> = vec![
            cidr(192, 168, 1, 0),
            cidr(10, 0, 0, 0),
            cidr(172, 16, 0, 0),
        ];
        let mut rng = SmallRng::seed_from_u64(0xcbd);

        for _round in 0..20 {
            let mut scheduler = Scheduler::default();
            let mut receivers = Vec::new();
            let mut guids = Vec::new();

            for _step in 0..300 {
                match rng.gen_range(0..6) {
                    0 => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        let addr = nets[rng.gen_range(0..nets.len())];
                        scheduler.add_worker(worker(id, addr, rng.gen_range(0..4), rng.gen_range(0..4)));
                    }
                    1 => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        let before = scheduler.workers.get(&MachineId::new(id)).map(|w| w.speed);
                        let addr = nets[rng.gen_range(0..nets.len())];
                        let mut update = worker(id, addr, rng.gen_range(0..4), rng.gen_range(0..4));
                        update.speed = rng.gen_range(0.0..100.0);
                        scheduler.update_worker(update);
                        if let Some(speed) = before {
                            // Merges never clobber the scheduler-owned speed
                            assert_eq!(scheduler.workers[&MachineId::new(id)].speed, speed);
                        }
                    }
                    2 => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        scheduler.remove_worker(&MachineId::new(id));
                    }
                    3 => {
                        let empty = rng.gen_bool(0.1);
                        let addrs = if empty {
                            Vec::new()
                        } else {
                            vec![nets[rng.gen_range(0..nets.len())]]
                        };
                        let (req, rx) = request(addrs);
                        let guid = req.guid;
                        match scheduler.schedule(req) {
                            Ok(()) => {
                                guids.push(guid);
                                receivers.push(rx);
                            }
                            Err(crate::Error::NoSourceAddresses) => {
                                assert!(empty && !scheduler.workers.is_empty());
                            }
                            Err(other) => panic!("Unexpected error: {:?}", other),
                        }
                    }
                    4 => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        let known = scheduler.workers.contains_key(&MachineId::new(id));
                        let result = scheduler.completed(&completed(id, rng.gen_range(0.0..50.0)));
                        assert_eq!(result.is_ok(), known);
                    }
                    _ => {
                        if !guids.is_empty() {
                            let guid = guids[rng.gen_range(0..guids.len())];
                            let _ = scheduler.cancel(guid);
                        }
                    }
                }
            }

            // Every answer a request ever saw is Queued/NoWorkers, or a
            // Valid naming a worker from the pool
            for mut rx in receivers {
                while let Ok(response) = rx.try_recv() {
                    match response {
                        WorkerResponse::Queued | WorkerResponse::NoWorkers => {}
                        WorkerResponse::Valid(allocation) => {
                            assert!(ids.contains(&allocation.id.as_str()));
                            assert_eq!(allocation.port, 56);
                        }
                    }
                }
            }

            // A drain without any state change is a fixed point
            let queued_before = scheduler.state_info().requests.len();
            scheduler.schedule_requests();
            assert_eq!(scheduler.state_info().requests.len(), queued_before);
        }
    }

    #[test]
    fn state_info_snapshots_workers_and_queue() {
        let mut scheduler = Scheduler::default();
        scheduler.add_worker(worker("a", cidr(192, 168, 1, 1), 1, 1));
        let (req, _rx) = request(vec![cidr(192, 168, 1, 3)]);
        scheduler.schedule(req).unwrap();

        let info = scheduler.state_info();
        assert_eq!(info.workers.len(), 1);
        assert_eq!(info.requests.len(), 1);
        assert_eq!(info.requests[0].requester.host, "client");
    }
}
