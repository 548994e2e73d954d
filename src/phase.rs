// COLOCATE SCHEDULING STATE MACHINE
// ORDERS THE LARGE JOBS: TWO IN PARALLEL, THEN CANNEAL, FERRET, FREQMINE.
// MINI JOBS (RADIX, DEDUP) ROTATE OUTSIDE THE PHASE SEQUENCE.
//
// ALL BRANCHING LIVES IN transition(). PHASES ONLY MOVE FORWARD.

use std::fmt;

use crate::job::{JobName, JobRegistry, JobStatus};

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Phase {
    Init = 0,
    BlackscholesVips = 1,
    BlackscholesCanneal = 2,
    VipsCanneal = 3,
    Canneal = 4,
    Ferret = 5,
    Freqmine = 6,
    Finish = 7,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::BlackscholesVips => "BLACKSCHOLES_VIPS",
            Self::BlackscholesCanneal => "BLACKSCHOLES_CANNEAL",
            Self::VipsCanneal => "VIPS_CANNEAL",
            Self::Canneal => "CANNEAL",
            Self::Ferret => "FERRET",
            Self::Freqmine => "FREQMINE",
            Self::Finish => "FINISH",
        }
    }

    // POSITION IN THE FORWARD ORDER. THE TWO CANNEAL BRANCHES SHARE A RANK.
    pub fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::BlackscholesVips => 1,
            Self::BlackscholesCanneal | Self::VipsCanneal => 2,
            Self::Canneal => 3,
            Self::Ferret => 4,
            Self::Freqmine => 5,
            Self::Finish => 6,
        }
    }

    // LARGE JOBS THAT OWN CORES WHILE THIS PHASE IS CURRENT
    pub fn active_jobs(self) -> &'static [JobName] {
        match self {
            Self::Init | Self::Finish => &[],
            Self::BlackscholesVips => &[JobName::Blackscholes, JobName::Vips],
            Self::BlackscholesCanneal => &[JobName::Blackscholes, JobName::Canneal],
            Self::VipsCanneal => &[JobName::Vips, JobName::Canneal],
            Self::Canneal => &[JobName::Canneal],
            Self::Ferret => &[JobName::Ferret],
            Self::Freqmine => &[JobName::Freqmine],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// WHAT THE TRANSITION NEEDS TO KNOW ABOUT THE REGISTRY
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Observed {
    pub blackscholes_alive: bool,
    pub vips_alive: bool,
    pub canneal_exited: bool,
    pub ferret_exited: bool,
    pub freqmine_exited: bool,
}

impl Observed {
    pub fn from_registry(registry: &JobRegistry) -> Self {
        let exited = |name| registry.status(name) == JobStatus::Exited;
        Self {
            blackscholes_alive: !exited(JobName::Blackscholes),
            vips_alive: !exited(JobName::Vips),
            canneal_exited: exited(JobName::Canneal),
            ferret_exited: exited(JobName::Ferret),
            freqmine_exited: exited(JobName::Freqmine),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transition {
    pub next: Phase,
    pub start: Vec<JobName>,
}

impl Transition {
    fn to(next: Phase, start: &[JobName]) -> Self {
        Self { next, start: start.to_vec() }
    }
}

pub fn transition(phase: Phase, seen: &Observed) -> Transition {
    use JobName as J;
    match phase {
        Phase::Init => Transition::to(
            Phase::BlackscholesVips,
            &[J::Blackscholes, J::Vips, J::Radix],
        ),
        Phase::BlackscholesVips => match (seen.blackscholes_alive, seen.vips_alive) {
            // A MINI JOB FINISHED. ROTATION IS NOT A PHASE CHANGE.
            (true, true) => Transition::to(phase, &[]),
            (true, false) => Transition::to(Phase::BlackscholesCanneal, &[J::Canneal]),
            (false, true) => Transition::to(Phase::VipsCanneal, &[J::Canneal]),
            (false, false) => Transition::to(Phase::Canneal, &[J::Canneal]),
        },
        // CANNEAL STARTED WITH THIS PHASE. THE SURVIVOR EXITING ENDS IT.
        // LEAVING EARLY WOULD DROP A LIVE SURVIVOR FROM THE ALLOCATION, STRANDED ON STALE CORES.
        Phase::BlackscholesCanneal if !seen.blackscholes_alive => Transition::to(Phase::Canneal, &[]),
        Phase::VipsCanneal if !seen.vips_alive => Transition::to(Phase::Canneal, &[]),
        Phase::BlackscholesCanneal | Phase::VipsCanneal => Transition::to(phase, &[]),
        Phase::Canneal if seen.canneal_exited => Transition::to(Phase::Ferret, &[J::Ferret]),
        Phase::Ferret if seen.ferret_exited => Transition::to(Phase::Freqmine, &[J::Freqmine]),
        Phase::Freqmine if seen.freqmine_exited => Transition::to(Phase::Finish, &[]),
        Phase::Canneal | Phase::Ferret | Phase::Freqmine | Phase::Finish => {
            Transition::to(phase, &[])
        }
    }
}

// FIRST MINI JOB THAT HAS NOT EXITED, IN ROTATION ORDER
pub fn current_mini_job(registry: &JobRegistry) -> Option<JobName> {
    JobName::MINI
        .iter()
        .copied()
        .find(|&j| registry.status(j) != JobStatus::Exited)
}

pub struct Strategy {
    phase: Phase,
    history: Vec<Phase>,
}

impl Strategy {
    pub fn new() -> Self {
        Self {
            phase: Phase::Init,
            history: vec![Phase::Init],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    // ADVANCES THE PHASE. CALL EXACTLY ONCE PER TICK THAT SAW A JOB FINISH.
    // FOLLOWS TRANSITIONS UNTIL ONE STAYS PUT: A JOB THAT EXITED OUT OF
    // ORDER MUST NOT LEAVE THE MACHINE WAITING FOR A FINISH THAT ALREADY HAPPENED.
    pub fn get_jobs_to_run(&mut self, registry: &JobRegistry) -> Vec<JobName> {
        let seen = Observed::from_registry(registry);
        let mut start = Vec::new();
        loop {
            let t = transition(self.phase, &seen);
            start.extend(t.start);
            if t.next == self.phase {
                return start;
            }
            tracing::info!(from = %self.phase, to = %t.next, "phase transition");
            self.phase = t.next;
            self.history.push(t.next);
        }
    }

    pub fn next_mini_job(&self, registry: &JobRegistry) -> Option<JobName> {
        current_mini_job(registry)
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cores::CoreSet;

    #[test]
    fn init_starts_two_large_and_first_mini() {
        let t = transition(Phase::Init, &Observed::default());
        assert_eq!(t.next, Phase::BlackscholesVips);
        assert_eq!(t.start, vec![JobName::Blackscholes, JobName::Vips, JobName::Radix]);
    }

    #[test]
    fn branch_phases_funnel_into_canneal() {
        for branch in [Phase::BlackscholesCanneal, Phase::VipsCanneal] {
            let t = transition(branch, &Observed::default());
            assert_eq!(t.next, Phase::Canneal);
            assert!(t.start.is_empty());
        }
    }

    #[test]
    fn branch_waits_for_its_survivor() {
        let seen = Observed {
            blackscholes_alive: true,
            canneal_exited: true,
            ..Observed::default()
        };
        assert_eq!(transition(Phase::BlackscholesCanneal, &seen).next, Phase::BlackscholesCanneal);
        assert_eq!(transition(Phase::VipsCanneal, &seen).next, Phase::Canneal);
    }

    #[test]
    fn out_of_order_exit_chains_forward() {
        let mut reg = JobRegistry::new();
        let t0 = chrono::DateTime::from_timestamp(0, 0).unwrap().naive_utc();
        for job in [JobName::Blackscholes, JobName::Vips, JobName::Radix] {
            reg.mark_started(job, job.initial_cores(), t0);
        }
        let mut strategy = Strategy::new();
        strategy.get_jobs_to_run(&reg);
        reg.mark_exited(JobName::Vips, t0);
        assert_eq!(strategy.get_jobs_to_run(&reg), vec![JobName::Canneal]);
        reg.mark_started(JobName::Canneal, CoreSet::of(&[2, 3]), t0);

        // CANNEAL BEATS BLACKSCHOLES: ONE CALL CARRIES BOTH EXITS THROUGH
        reg.mark_exited(JobName::Canneal, t0);
        assert!(strategy.get_jobs_to_run(&reg).is_empty());
        assert_eq!(strategy.phase(), Phase::BlackscholesCanneal);
        reg.mark_exited(JobName::Blackscholes, t0);
        assert_eq!(strategy.get_jobs_to_run(&reg), vec![JobName::Ferret]);
        assert_eq!(strategy.phase(), Phase::Ferret);
        assert_eq!(
            strategy.history(),
            &[Phase::Init, Phase::BlackscholesVips, Phase::BlackscholesCanneal, Phase::Canneal, Phase::Ferret]
        );
    }

    #[test]
    fn finish_is_terminal() {
        let seen = Observed {
            canneal_exited: true,
            ferret_exited: true,
            freqmine_exited: true,
            ..Observed::default()
        };
        assert_eq!(transition(Phase::Finish, &seen), Transition::to(Phase::Finish, &[]));
    }

    #[test]
    fn active_jobs_cover_transition_starts() {
        // EVERY JOB A TRANSITION STARTS IS ACTIVE IN THE PHASE IT LEADS TO
        let seen = Observed {
            blackscholes_alive: true,
            ..Observed::default()
        };
        let t = transition(Phase::BlackscholesVips, &seen);
        for job in &t.start {
            assert!(t.next.active_jobs().contains(job));
        }
    }

    #[test]
    fn ranks_strictly_order_the_main_path() {
        let path = [
            Phase::Init,
            Phase::BlackscholesVips,
            Phase::VipsCanneal,
            Phase::Canneal,
            Phase::Ferret,
            Phase::Freqmine,
            Phase::Finish,
        ];
        for w in path.windows(2) {
            assert!(w[0].rank() < w[1].rank(), "{} !< {}", w[0], w[1]);
        }
    }
}
