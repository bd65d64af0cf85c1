// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Imaging sessions: gridding and degridding whole major cycles.
//!
//! CFs are made on a separate thread, one spectral window ahead of the
//! gridding thread. The two hand over through a [`CoordinationChannel`], so
//! at most one batch of CFs is waiting at any time. Only the gridding thread
//! writes to the CF store.

mod error;

pub use error::ImagingError;

use std::{collections::HashMap, thread};

use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use scopeguard::defer_on_unwind;

use crate::{
    cf::{CFCell, CFIndexer, CFStore, CfAxis, CfCache, CfError},
    config::GridderConfig,
    coordination::CoordinationChannel,
    grid::{GridAccumulator, GridGeometry, GridShape, GridSnapshot},
    prepare::{CFPreparer, PrepareError},
    resample::{degrid_into, new_resampler, FluxScaleTable, GridStats, Resampler},
    vis::{
        mapper::{MapStats, VisToDeviceMapper},
        ChanMap, ImagingMode, PolMap, SpectralWindow, VisBuffer, VisBufferMut, VisRecord,
    },
    PROGRESS_BARS, RESAMPLE_DEVICE,
};

/// The CFs made for one spectral window.
#[derive(Debug)]
pub struct CfBatch {
    pub spw: usize,
    pub result: Result<Vec<CFCell>, PrepareError>,
}

/// What happened during a major cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    /// Spectral windows that were processed.
    pub spws: Vec<usize>,
    /// Spectral windows that contributed nothing, and why.
    pub skipped_spws: Vec<(usize, String)>,
    /// Records dropped because no CF could be found or made for them.
    pub dropped_records: usize,
    pub cfs_made: usize,
    pub map_stats: MapStats,
    pub grid_stats: GridStats,
    /// The number of model visibilities written (predict cycles only).
    pub predicted: usize,
}

pub struct ImagingSession {
    config: GridderConfig,
    geometry: GridGeometry,
    store: CFStore,
    preparer: Mutex<CFPreparer>,
    resampler: Box<dyn Resampler>,
    acc: GridAccumulator,
    flux: Option<FluxScaleTable>,
    /// Per spectral window, overriding the defaults.
    maps: HashMap<usize, (Option<ChanMap>, Option<PolMap>)>,
}

impl ImagingSession {
    pub fn new(config: GridderConfig) -> Result<ImagingSession, ImagingError> {
        config.validate()?;
        let geometry = config.geometry();
        let shape = config.shape();
        let cache = config
            .cf
            .cache_dir
            .as_ref()
            .map(CfCache::new)
            .transpose()?;
        let preparer = CFPreparer::new(
            config.prepare_config(),
            config.aperture_table(),
            geometry,
            (0..shape.n_pol).collect(),
            cache,
        )?;

        RESAMPLE_DEVICE.store(config.resample_device());
        let resampler = new_resampler(config.num_threads())?;
        let acc = GridAccumulator::new(shape)?;
        let flux = config.flux_table()?;
        info!(
            "Imaging session: {}x{} grid, {} channels, {} pols, CF support {} sampling {}",
            shape.nx, shape.ny, shape.n_chan, shape.n_pol, config.cf.support, config.cf.sampling
        );

        Ok(ImagingSession {
            store: CFStore::new(config.store_config()),
            config,
            geometry,
            preparer: Mutex::new(preparer),
            resampler,
            acc,
            flux,
            maps: HashMap::new(),
        })
    }

    pub fn config(&self) -> &GridderConfig {
        &self.config
    }

    pub fn store(&self) -> &CFStore {
        &self.store
    }

    pub fn accumulator(&self) -> &GridAccumulator {
        &self.acc
    }

    pub fn snapshot(&self) -> GridSnapshot {
        self.acc.snapshot()
    }

    pub fn resampler(&self) -> &dyn Resampler {
        self.resampler.as_ref()
    }

    /// Use `map` for the channels of spectral window `spw`. By default, all
    /// channels go to grid channel 0 if the grid has one channel, and to the
    /// grid channel with the same index otherwise.
    pub fn set_chan_map(&mut self, spw: usize, map: ChanMap) {
        self.maps.entry(spw).or_default().0 = Some(map);
    }

    /// Use `map` for the polarisations of spectral window `spw`. By default,
    /// data polarisations go to the grid polarisation with the same index.
    pub fn set_pol_map(&mut self, spw: usize, map: PolMap) {
        self.maps.entry(spw).or_default().1 = Some(map);
    }

    /// Remove all CFs, so they are made again when next needed.
    pub fn clear_cfs(&mut self) {
        self.store.clear();
        self.preparer.get_mut().forget_produced();
    }

    /// Grid every buffer into a freshly zeroed grid. Buffers are gridded in
    /// the order of `spws`; a buffer whose spectral window isn't in `spws` is
    /// an error.
    pub fn run_major_cycle<B: VisBuffer>(
        &mut self,
        spws: &[SpectralWindow],
        buffers: &[B],
        mode: ImagingMode,
    ) -> Result<CycleReport, ImagingError> {
        check_spws(spws, buffers)?;
        info!("Gridding {} buffers ({mode})", buffers.len());
        self.acc.reset(self.acc.shape())?;

        let report = self.run_pipeline(spws, |stage, spw| {
            for vb in buffers.iter().filter(|vb| vb.spw() == spw.id) {
                let Some(records) = stage.map_buffer(spw, vb, mode)? else {
                    return Ok(());
                };
                let stats = stage
                    .resampler
                    .grid(&records, stage.store, &stage.geometry, stage.acc)?;
                stage.report.grid_stats += stats;
            }
            Ok(())
        })?;

        info!(
            "Gridded {} records ({} off the grid)",
            report.grid_stats.gridded, report.grid_stats.off_grid
        );
        Ok(report)
    }

    /// Predict model visibilities for every buffer from the current grid,
    /// writing them into the buffers.
    pub fn predict_major_cycle<B: VisBufferMut>(
        &mut self,
        spws: &[SpectralWindow],
        buffers: &mut [B],
    ) -> Result<CycleReport, ImagingError> {
        check_spws(spws, buffers)?;
        info!("Predicting {} buffers", buffers.len());

        let report = self.run_pipeline(spws, |stage, spw| {
            for vb in buffers.iter_mut().filter(|vb| vb.spw() == spw.id) {
                let Some(records) = stage.map_buffer(spw, &*vb, ImagingMode::Residual)? else {
                    return Ok(());
                };
                let predictions = stage.resampler.degrid(
                    &records,
                    stage.store,
                    &stage.geometry,
                    stage.acc,
                    stage.flux,
                )?;
                let pol_map = stage.pol_map(spw.id, &*vb);
                stage.report.predicted += degrid_into(&records, &predictions, &pol_map, vb);
            }
            Ok(())
        })?;

        info!("Predicted {} visibilities", report.predicted);
        Ok(report)
    }

    /// Run CF preparation on a worker thread while `per_spw` consumes each
    /// spectral window's CFs on this thread.
    fn run_pipeline<F>(
        &mut self,
        spws: &[SpectralWindow],
        mut per_spw: F,
    ) -> Result<CycleReport, ImagingError>
    where
        F: FnMut(&mut Stage, &SpectralWindow) -> Result<(), ImagingError>,
    {
        let ImagingSession {
            geometry,
            store,
            preparer,
            resampler,
            acc,
            flux,
            maps,
            ..
        } = self;
        let preparer: &Mutex<CFPreparer> = preparer;
        let channel: CoordinationChannel<CfBatch> = CoordinationChannel::new();
        // Use a variable to track whether the worker has an issue.
        let error = AtomicCell::new(false);

        let pb = ProgressBar::with_draw_target(
            Some(spws.len() as _),
            if PROGRESS_BARS.load() {
                ProgressDrawTarget::stdout()
            } else {
                ProgressDrawTarget::hidden()
            },
        )
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} spws ({elapsed_precise}<{eta_precise})")
                .expect("progress bar template is valid")
                .progress_chars("=> "),
        )
        .with_position(0)
        .with_message("Resampling");

        let mut stage = Stage {
            geometry: *geometry,
            shape: acc.shape(),
            store,
            preparer,
            resampler: &**resampler,
            acc,
            flux: flux.as_ref(),
            maps,
            report: CycleReport::default(),
            on_demand_done: false,
            skipped: false,
        };

        let result = thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("cf-prepare".to_string())
                .spawn_scoped(scope, || {
                    // If a panic happens, update our atomic error and let the
                    // consumer go.
                    defer_on_unwind! { error.store(true); channel.abort(); }
                    prepare_thread(spws, preparer, &channel)
                })
                .expect("OS can create threads");

            let result = consume(&mut stage, spws, &channel, &mut per_spw, &pb);
            if result.is_err() {
                channel.abort();
            }
            // A worker panic is reported through `error`.
            let _ = worker.join();
            result
        });
        pb.finish();

        if error.load() {
            error!("The CF preparation thread panicked");
            return Err(ImagingError::WorkerPanicked);
        }
        if let Err(e) = result {
            error!("{e}");
            return Err(e);
        }
        Ok(stage.report)
    }
}

/// Every buffer must belong to one of `spws`.
fn check_spws<B: VisBuffer>(spws: &[SpectralWindow], buffers: &[B]) -> Result<(), ImagingError> {
    match buffers
        .iter()
        .find(|vb| !spws.iter().any(|s| s.id == vb.spw()))
    {
        Some(vb) => Err(ImagingError::UnknownSpw { spw: vb.spw() }),
        None => Ok(()),
    }
}

/// The worker: make the CFs of each spectral window in turn.
fn prepare_thread(
    spws: &[SpectralWindow],
    preparer: &Mutex<CFPreparer>,
    channel: &CoordinationChannel<CfBatch>,
) {
    for spw in spws {
        if channel.begin_preparing().is_err() {
            debug!("CF preparation stopped before spw {}", spw.id);
            return;
        }
        let result = preparer.lock().prepare_for_spw(spw);
        match &result {
            Ok(cells) => debug!("Made {} CFs for spw {}", cells.len(), spw.id),
            Err(e) => debug!("Couldn't make CFs for spw {}: {e}", spw.id),
        }
        if channel.publish(CfBatch { spw: spw.id, result }).is_err() {
            return;
        }
    }
    if let Err(e) = channel.finish() {
        debug!("CF preparation didn't finish cleanly: {e}");
    }
}

/// The gridding side of the pipeline.
fn consume<F>(
    stage: &mut Stage,
    spws: &[SpectralWindow],
    channel: &CoordinationChannel<CfBatch>,
    per_spw: &mut F,
    pb: &ProgressBar,
) -> Result<(), ImagingError>
where
    F: FnMut(&mut Stage, &SpectralWindow) -> Result<(), ImagingError>,
{
    for spw in spws {
        let Some(batch) = channel.take()? else {
            // The worker only stops early if it panicked.
            break;
        };
        debug_assert_eq!(batch.spw, spw.id);
        let inserted = batch.result.map(|cells| stage.insert(cells));
        channel.release()?;

        match inserted {
            Ok(n) => {
                debug!(
                    "spw {}: {n} new CFs, {} in the store",
                    spw.id,
                    stage.store.len()
                );
                stage.on_demand_done = false;
                stage.skipped = false;
                per_spw(stage, spw)?;
                if !stage.skipped {
                    stage.report.spws.push(spw.id);
                }
            }
            Err(e) => stage.skip(spw, &e),
        }
        pb.inc(1);
    }
    Ok(())
}

/// Everything the consuming thread works with during a cycle.
struct Stage<'a> {
    geometry: GridGeometry,
    shape: GridShape,
    store: &'a mut CFStore,
    preparer: &'a Mutex<CFPreparer>,
    resampler: &'a dyn Resampler,
    acc: &'a mut GridAccumulator,
    flux: Option<&'a FluxScaleTable>,
    maps: &'a HashMap<usize, (Option<ChanMap>, Option<PolMap>)>,
    report: CycleReport,
    /// Has on-demand preparation been tried for the current spw?
    on_demand_done: bool,
    /// Has the current spw been skipped?
    skipped: bool,
}

impl Stage<'_> {
    /// Put cells into the store, returning how many were new.
    fn insert(&mut self, cells: Vec<CFCell>) -> usize {
        let mut n = 0;
        for cell in cells {
            match self.store.insert(cell, false) {
                Ok(_) => n += 1,
                Err(CfError::Duplicate(key)) => trace!("Already have a CF for {key}"),
                Err(e) => warn!("Couldn't store a CF: {e}"),
            }
        }
        self.report.cfs_made += n;
        n
    }

    fn skip(&mut self, spw: &SpectralWindow, reason: &dyn std::fmt::Display) {
        warn!("Skipping spw {}: {reason}", spw.id);
        self.report.skipped_spws.push((spw.id, reason.to_string()));
        self.skipped = true;
    }

    fn chan_map<B: VisBuffer + ?Sized>(&self, spw: usize, vb: &B) -> ChanMap {
        match self.maps.get(&spw).and_then(|(c, _)| c.as_ref()) {
            Some(m) => m.clone(),
            None if self.shape.n_chan == 1 => ChanMap::constant(vb.num_chans(), 0),
            None => ChanMap::identity(vb.num_chans()),
        }
    }

    fn pol_map<B: VisBuffer + ?Sized>(&self, spw: usize, vb: &B) -> PolMap {
        match self.maps.get(&spw).and_then(|(_, p)| p.as_ref()) {
            Some(m) => m.clone(),
            None => PolMap::identity(vb.num_pols()),
        }
    }

    /// Turn a buffer into records. A record whose CF is missing triggers one
    /// round of CF preparation for the spw; records still without a CF after
    /// that are dropped. `None` means the spw has been skipped.
    fn map_buffer<B: VisBuffer + ?Sized>(
        &mut self,
        spw: &SpectralWindow,
        vb: &B,
        mode: ImagingMode,
    ) -> Result<Option<Vec<VisRecord>>, ImagingError> {
        let chan_map = self.chan_map(spw.id, vb);
        let pol_map = self.pol_map(spw.id, vb);
        let mapper = VisToDeviceMapper::new(mode, self.shape, &self.geometry);

        loop {
            let mut records = vec![];
            let mut missing = vec![];
            let mut it = mapper.map(vb, &chan_map, &pol_map, CFIndexer::new(&*self.store));
            for r in &mut it {
                match r {
                    Ok(r) => records.push(r),
                    Err(e @ CfError::Missing { .. }) => missing.push(e),
                    Err(e) => return Err(e.into()),
                }
            }
            let stats = it.stats();

            if missing.is_empty() || self.on_demand_done {
                if let Some(e) = missing.first() {
                    warn!(
                        "spw {}: dropping {} records without CFs ({e})",
                        spw.id,
                        missing.len()
                    );
                    self.report.dropped_records += missing.len();
                }
                self.report.map_stats += stats;
                return Ok(Some(records));
            }

            debug!(
                "spw {}: {} records have no CF; making CFs now",
                spw.id,
                missing.len()
            );
            self.on_demand_done = true;
            if let Err(e) = self.prepare_now(spw, &missing) {
                self.skip(spw, &e);
                return Ok(None);
            }
        }
    }

    fn prepare_now(&mut self, spw: &SpectralWindow, missing: &[CfError]) -> Result<(), PrepareError> {
        let cells = {
            let mut preparer = self.preparer.lock();
            for e in missing {
                if let CfError::Missing {
                    axis: CfAxis::ParallacticAngle,
                    requested,
                    ..
                } = e
                {
                    if preparer.add_pa_bin(*requested) {
                        debug!("Added a PA bin at {requested} rad");
                    }
                }
            }
            preparer.prepare_for_spw(spw)?
        };
        let n = self.insert(cells);
        debug!("spw {}: made {n} CFs on demand", spw.id);
        Ok(())
    }
}
