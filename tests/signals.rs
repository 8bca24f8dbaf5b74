// These tests cannot run under the regular test harness: traps are
// process-wide state and the harness runs tests on several threads at
// once. So we make our own, sequential harnessing.

#[cfg(unix)]
fn main() {
    self::test::usr1_delivered_on_loop_thread();
    self::test::ten_raises_aggregate_to_ten();
    self::test::two_sources_route_independently();
}

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use mainloop::{MainLoop, PostAction, Signal};

    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    pub fn usr1_delivered_on_loop_thread() {
        let event_loop = MainLoop::new().unwrap();

        let main_thread = std::thread::current().id();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        event_loop
            .add_unix_signal(&[Signal::SIGUSR1], move |signals| {
                assert_eq!(std::thread::current().id(), main_thread);
                assert!(signals.iter().all(|&s| s == Signal::SIGUSR1));
                received2.fetch_add(signals.len(), Ordering::SeqCst);
                PostAction::Continue
            })
            .unwrap();

        kill(Pid::this(), Signal::SIGUSR1).unwrap();

        event_loop.step().unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    pub fn ten_raises_aggregate_to_ten() {
        let event_loop = MainLoop::new().unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        let quitter = event_loop.clone();
        event_loop
            .add_unix_signal(&[Signal::SIGUSR1], move |signals| {
                if received2.fetch_add(signals.len(), Ordering::SeqCst) + signals.len() >= 10 {
                    quitter.quit();
                }
                PostAction::Continue
            })
            .unwrap();

        for _ in 0..10 {
            kill(Pid::this(), Signal::SIGUSR1).unwrap();
        }

        // Safety net in case deliveries go missing.
        let quitter = event_loop.clone();
        event_loop
            .add_once(Duration::from_secs(5), move || quitter.quit())
            .unwrap();

        event_loop.run().unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 10);
    }

    pub fn two_sources_route_independently() {
        let event_loop = MainLoop::new().unwrap();

        let seen = Arc::new(Mutex::new((false, false)));

        let seen1 = seen.clone();
        let quitter1 = event_loop.clone();
        event_loop
            .add_unix_signal(&[Signal::SIGUSR1], move |signals| {
                assert!(signals.contains(&Signal::SIGUSR1));
                let mut seen = seen1.lock().unwrap();
                seen.0 = true;
                if seen.1 {
                    quitter1.quit();
                }
                PostAction::Continue
            })
            .unwrap();

        let seen2 = seen.clone();
        let quitter2 = event_loop.clone();
        event_loop
            .add_unix_signal(&[Signal::SIGUSR2], move |signals| {
                assert!(signals.contains(&Signal::SIGUSR2));
                let mut seen = seen2.lock().unwrap();
                seen.1 = true;
                if seen.0 {
                    quitter2.quit();
                }
                PostAction::Continue
            })
            .unwrap();

        kill(Pid::this(), Signal::SIGUSR1).unwrap();
        kill(Pid::this(), Signal::SIGUSR2).unwrap();

        let quitter = event_loop.clone();
        event_loop
            .add_once(Duration::from_millis(400), move || quitter.quit())
            .unwrap();

        event_loop.run().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.0, "USR1 was not delivered");
        assert!(seen.1, "USR2 was not delivered");
    }
}
