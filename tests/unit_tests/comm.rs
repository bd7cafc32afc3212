use sleipnir::comm::{Communicator, LocalComm, ThreadedComm};

#[test]
fn local_comm_is_the_identity() {
    let comm = LocalComm;
    assert_eq!(Communicator::<f64>::size(&comm), 1);
    assert_eq!(comm.all_reduce_sum(3.5_f64).unwrap(), 3.5);
    assert_eq!(Communicator::<f64>::all_reduce_sum_u64(&comm, 7).unwrap(), 7);
}

#[test]
fn threaded_all_reduce_returns_the_identical_total_on_every_rank() {
    let comms = ThreadedComm::<f64>::create(3);
    let totals: Vec<(f64, u64)> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let local = (comm.rank() + 1) as f64;
                    let sum = comm.all_reduce_sum(local).unwrap();
                    let count = comm.all_reduce_sum_u64(comm.rank() as u64 + 1).unwrap();
                    (sum, count)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (sum, count) in totals {
        assert_eq!(sum, 6.0);
        assert_eq!(count, 6);
    }
}

#[test]
fn threaded_neighbor_exchange_swaps_blocks_pairwise() {
    let comms = ThreadedComm::<f64>::create(2);
    let received: Vec<Vec<f64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let peer = 1 - comm.rank();
                    let send = vec![vec![comm.rank() as f64; 3]];
                    let mut recv = vec![Vec::new()];
                    comm.neighbor_exchange(&[peer], &send, &mut recv).unwrap();
                    recv.remove(0)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(received[0], vec![1.0; 3]);
    assert_eq!(received[1], vec![0.0; 3]);
}

#[test]
fn repeated_reductions_stay_in_lockstep() {
    // Interleaved reductions and exchanges must pair up message-by-message.
    let comms = ThreadedComm::<f64>::create(2);
    let results: Vec<f64> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let mut total = 0.0;
                    for round in 0..10 {
                        total += comm.all_reduce_sum(round as f64).unwrap();
                    }
                    total
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], 90.0);
}
