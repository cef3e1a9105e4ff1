// Shared physical constants and tuning defaults.

/// Speed of light in vacuum (m/s).
pub const C_VACUUM: f64 = 299_792_458.0;

/// Speed of light in air (m/s), refractive index 1.00032.
pub const C_AIR: f64 = C_VACUUM / 1.00032;

/// Feet to metres.
pub const FTOM: f64 = 0.3048;

/// Metres to feet.
pub const MTOF: f64 = 1.0 / FTOM;

/// Maximum plausible straight-line range receiver to transmitter (m).
pub const MAX_RANGE: f64 = 500e3;

/// Wall-clock pairing window for joint DF17 sightings (s).
pub const SYNC_PAIRING_WINDOW: f64 = 5.0;

/// Accepted observations needed before a pair leaves bootstrap.
pub const PAIR_BOOTSTRAP_OBS: usize = 4;

/// Bootstrap must complete within this window (s) or it starts over.
pub const PAIR_BOOTSTRAP_WINDOW: f64 = 30.0;

/// Minimum accepted observations before a pair is published to the graph.
pub const PAIR_PUBLISH_MIN_OBS: usize = 6;

/// Consecutive innovation-gate rejections that desynchronize a pair.
pub const PAIR_MAX_CONSECUTIVE_REJECTS: usize = 6;

/// Innovation gate in units of predicted standard deviation.
pub const PAIR_INNOVATION_GATE: f64 = 4.0;

/// Measurement-noise floor for pair observations (s^2): (50 ns)^2.
pub const PAIR_NOISE_FLOOR: f64 = 50e-9 * 50e-9;

/// Oscillator random-walk density, offset component (s per sqrt(s)).
pub const PAIR_Q_OFFSET: f64 = 100e-9;

/// Oscillator random-walk density, rate component (per sqrt(s)).
pub const PAIR_Q_RATE: f64 = 1e-6;

/// Pair evicted after this long without an update (s).
pub const PAIR_IDLE_TIMEOUT: f64 = 60.0;

/// Per-hop variance penalty in the clock graph (s^2); biases toward short paths.
pub const GRAPH_HOP_PENALTY: f64 = 1e-14;

/// Edge jitter variance above this is not published to the graph (s^2): (2 us)^2.
pub const GRAPH_EDGE_CUTOFF: f64 = 4e-12;

/// Translation paths accumulating more variance than this fail (s^2): (10 us)^2.
pub const GRAPH_PATH_CEILING: f64 = 1e-10;

/// Correlation window for same-transmission grouping (s).
pub const CORRELATION_WINDOW: f64 = 2e-3;

/// Delay before a group is closed and handed to the solver (s).
pub const GROUP_CLOSE_DELAY: f64 = 0.5;

/// Distinct receivers required for a solvable group.
pub const GROUP_MIN_RECEIVERS: usize = 3;

/// Solver queue length above which work moves to the blocking pool.
pub const SOLVER_QUEUE_HIGH_WATER: usize = 8;

/// Solver queue hard cap; beyond it the weakest groups are shed.
pub const SOLVER_QUEUE_CAP: usize = 64;

/// Levenberg-Marquardt initial damping.
pub const SOLVER_LAMBDA0: f64 = 1e-3;

/// Solver iteration cap.
pub const SOLVER_MAX_ITER: usize = 20;

/// Solver convergence step norm (m).
pub const SOLVER_STEP_TOL: f64 = 1.0;

/// Solver wall-clock budget (s).
pub const SOLVER_WALL_BUDGET: f64 = 10e-3;

/// Accept threshold on chi^2 per degree of freedom.
pub const SOLVER_MAX_CHI2_DOF: f64 = 25.0;

/// Accept threshold on the horizontal error ellipse semi-major axis (m).
pub const SOLVER_MAX_HORIZ_ERR: f64 = 10e3;

/// Variance of the altitude equality constraint (m^2).
pub const ALTITUDE_CONSTRAINT_VAR: f64 = 10.0;

/// Altitude acceptance band for unconstrained solutions (m).
pub const MIN_ALT: f64 = -1500.0 * FTOM;
pub const MAX_ALT: f64 = 18_000.0;

/// Baseline condition number above which geometry is rejected.
pub const GEOMETRY_MAX_COND: f64 = 1e6;

/// Dilution-of-precision cap at the initial guess. Ground arrays always
/// have weak vertical geometry, so this only catches true degeneracies.
pub const GEOMETRY_MAX_DOP: f64 = 2000.0;

/// Receiver dropped after this long without traffic (s).
pub const RECEIVER_SILENCE_TIMEOUT: f64 = 30.0;

/// Per-session inbound message rate limit (msgs/s).
pub const SESSION_RATE_LIMIT: usize = 5000;

/// Arrivals kept in the per-session history ring.
pub const SESSION_HISTORY: usize = 64;

/// Tick gap treated as a session restart rather than a wrap (s).
pub const SESSION_GAP_RESET: f64 = 1.0;

/// Aircraft track expires after this long without a fix (s).
pub const AIRCRAFT_TIMEOUT: f64 = 30.0;

/// Mahalanobis gate for accepting a fix against the track history.
pub const AIRCRAFT_GATE: f64 = 5.0;

/// Minimum NUCp for a DF17 position used as a sync reference.
pub const MIN_NUC: u8 = 6;

/// Status snapshot interval (s).
pub const STATUS_INTERVAL: f64 = 15.0;
