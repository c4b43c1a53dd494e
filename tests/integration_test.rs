//! Cross-module scenarios.
//!
//! - A module is prepared for hot patching, laid out into an image and
//!   decomposed back from its metadata
//! - A crash report walks the whole retry ladder
//! - The logging service runs a full lifecycle and stores counters sent by
//!   an agent through a real trace session

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use hotpatch::agent::module_data::BASIC_BLOCK_ENTRY_AGENT_ID;
use hotpatch::agent::IndexedFrequencyData;
use hotpatch::block_graph::{BlockType, Label, LabelAttributes, Reference, ReferenceKind};
use hotpatch::pe::CODE_SECTION_CHARACTERISTICS;
use hotpatch::repository::{CrashKeys, ManualClock, PermanentFailureHandler, INCOMING_DIR, RETRY2_DIR, RETRY_DIR};
use hotpatch::service::symbols::{format_stack_trace, SymbolInfo};
use hotpatch::service::ServiceBackend;
use hotpatch::trace::format::{data_type, IndexedFrequencyHeader, RecordType};
use hotpatch::trace::{TraceFileReader, TraceSink};
use hotpatch::{
    BasicBlockEntry, BlockGraph, EndpointConfig, HotPatchingDecomposer, HotPatchingMetadataWriter,
    HotPatchingTransform, ImageLayout, LoggerService, MappedImage, ModuleIdentity, ReportRepository,
    RepositoryConfig, RpcClient, Service, ServiceConfig, ServiceState,
};

const IMAGE_BASE: u32 = 0x0040_0000;

#[test]
fn test_prepared_module_decomposes_back() {
    let mut graph = BlockGraph::new();
    let text = graph.add_section(".text", CODE_SECTION_CHARACTERISTICS);

    // call callee; ret
    let caller = graph.add_block_at(BlockType::Code, 0x00, 6, "caller").unwrap();
    graph.block_mut(caller).set_data(vec![0xE8, 0, 0, 0, 0, 0xC3]);
    // inc eax; ret
    let callee = graph.add_block_at(BlockType::Code, 0x10, 2, "callee").unwrap();
    graph.block_mut(callee).set_data(vec![0x40, 0xC3]);
    // jmp [eax*4 + table]; ret; ret; table: dd case0, case1
    let mut switch_bytes = vec![0xFF, 0x24, 0x85, 0, 0, 0, 0, 0xC3, 0xC3, 0x90, 0x90, 0x90];
    switch_bytes.extend_from_slice(&[0; 8]);
    let switch = graph.add_block_at(BlockType::Code, 0x20, switch_bytes.len(), "switch").unwrap();
    {
        let block = graph.block_mut(switch);
        block.set_data(switch_bytes);
        block.set_label(0, Label::new("<code>", LabelAttributes::CODE));
        block.set_label(12, Label::new("<jump-table>", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE));
        block.set_reference(3, Reference::new(ReferenceKind::Absolute, 4, switch, 12));
        block.set_reference(12, Reference::new(ReferenceKind::Absolute, 4, switch, 7));
        block.set_reference(16, Reference::new(ReferenceKind::Absolute, 4, switch, 8));
    }
    graph
        .block_mut(caller)
        .set_reference(1, Reference::new(ReferenceKind::PcRelative, 4, callee, 0));
    for id in [caller, callee, switch] {
        graph.block_mut(id).set_section(Some(text));
    }

    let mut transform = HotPatchingTransform::new();
    transform.apply(&mut graph).unwrap();
    assert_eq!(transform.prepared_blocks().len(), 3);
    assert_eq!(graph.block(callee).data(), &[0x66, 0x90, 0x40, 0xC3]);

    HotPatchingMetadataWriter::with_blocks(transform.prepared_blocks())
        .write(&mut graph)
        .unwrap();
    let layout = ImageLayout::build(&mut graph, IMAGE_BASE, 0x1000, 0x1000);
    layout.finalize_references(&mut graph);
    let image = layout.to_image(&graph);

    for id in [caller, callee, switch] {
        let block = graph.block(id);
        assert_eq!(block.alignment() % 2, 0);
        assert_eq!(block.padding_before(), 5);
        assert_eq!(block.addr() % 2, 0);
    }

    let decomposed = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &image))
        .decompose()
        .unwrap();
    assert_eq!(decomposed.blocks.len(), 3);

    let mut original: Vec<_> = vec![caller, callee, switch];
    original.sort_by_key(|&id| graph.block(id).addr());
    let recovered = &decomposed.blocks;
    for (&before, &after) in original.iter().zip(recovered) {
        let before = graph.block(before);
        let after = decomposed.graph.block(after);
        assert_eq!(after.addr(), IMAGE_BASE as u64 + before.addr());
        assert_eq!(after.data(), before.data());
    }

    let position = |id| original.iter().position(|&o| o == id).unwrap();
    let new_caller = recovered[position(caller)];
    let new_callee = recovered[position(callee)];
    let new_switch = recovered[position(switch)];

    assert_eq!(
        decomposed.graph.block(new_caller).reference(1),
        Some(&Reference::new(ReferenceKind::PcRelative, 4, new_callee, 0))
    );
    let switch_block = decomposed.graph.block(new_switch);
    for (offset, target) in [(3, 12), (12, 7), (16, 8)] {
        assert_eq!(
            switch_block.reference(offset),
            Some(&Reference::new(ReferenceKind::Absolute, 4, new_switch, target))
        );
    }
}

#[derive(Clone, Default)]
struct RecordingHandler(Arc<Mutex<Vec<(PathBuf, PathBuf)>>>);

impl PermanentFailureHandler for RecordingHandler {
    fn handle(&mut self, minidump: &Path, crash_keys: &Path) -> bool {
        assert!(minidump.exists() && crash_keys.exists());
        self.0.lock().push((minidump.to_path_buf(), crash_keys.to_path_buf()));
        true
    }
}

fn report_files(root: &Path, dir: &str) -> usize {
    std::fs::read_dir(root.join(dir)).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn test_repository_retry_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("reports");
    let clock = ManualClock::new(SystemTime::now());
    let handler = RecordingHandler::default();
    let attempts = Arc::new(Mutex::new(0usize));
    let counted = attempts.clone();

    let mut repository = ReportRepository::new(
        RepositoryConfig {
            root: root.clone(),
            retry_interval: Duration::from_secs(20),
        },
        Box::new(clock.clone()),
        Box::new(move |_: &Path, keys: &CrashKeys| {
            assert_eq!(keys.get("channel").map(String::as_str), Some("beta"));
            *counted.lock() += 1;
            false
        }),
        Box::new(handler.clone()),
    );

    let dump = dir.path().join("crash.dmp");
    std::fs::write(&dump, b"MDMP").unwrap();
    let keys: CrashKeys = [("channel".to_string(), "beta".to_string())].into_iter().collect();
    repository.store_report(&dump, &keys).unwrap();
    assert_eq!(report_files(&root, INCOMING_DIR), 2);

    assert!(!repository.upload_pending_report());
    assert_eq!(report_files(&root, INCOMING_DIR), 0);
    assert_eq!(report_files(&root, RETRY_DIR), 2);

    clock.advance(Duration::from_secs(10));
    assert!(repository.upload_pending_report());
    assert_eq!(*attempts.lock(), 1);
    assert_eq!(report_files(&root, RETRY_DIR), 2);

    clock.advance(Duration::from_secs(11));
    assert!(!repository.upload_pending_report());
    assert_eq!(report_files(&root, RETRY_DIR), 0);
    assert_eq!(report_files(&root, RETRY2_DIR), 2);

    clock.advance(Duration::from_secs(21));
    assert!(!repository.upload_pending_report());
    assert_eq!(*attempts.lock(), 3);
    assert_eq!(handler.0.lock().len(), 1);
    let (failed_dump, failed_keys) = handler.0.lock()[0].clone();
    assert_eq!(failed_dump.extension().unwrap(), "dmp");
    assert_eq!(failed_keys.extension().unwrap(), "kys");
    assert!(!failed_dump.exists() && !failed_keys.exists());
    assert_eq!(repository.report_count(), 0);
    assert!(repository.upload_pending_report());
}

fn service_config(tag: &str, dir: &Path) -> ServiceConfig {
    ServiceConfig {
        endpoint: EndpointConfig::with_instance_id(format!("it-{tag}-{}", std::process::id())),
        trace_dir: dir.to_path_buf(),
        minidump_dir: dir.to_path_buf(),
        log_file: Some(dir.join("service.log")),
        ..ServiceConfig::default()
    }
}

fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnMut() -> bool + Send + 'static {
    let log = log.clone();
    move || {
        log.lock().push(name);
        true
    }
}

#[test]
fn test_service_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::new("logger", LoggerService::new(service_config("life", dir.path())).unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));
    service.set_on_initialized(record(&log, "initialized"));
    service.set_on_started(record(&log, "started"));
    service.set_on_interrupted(record(&log, "interrupted"));
    service.set_on_stopped(record(&log, "stopped"));

    assert_eq!(service.state(), ServiceState::Unused);
    service.start().unwrap();
    assert_eq!(service.state(), ServiceState::Running);
    assert_eq!(log.lock().as_slice(), &["initialized", "started"]);

    service.stop().unwrap();
    service.join().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(log.lock().as_slice(), &["initialized", "started", "interrupted", "stopped"]);
    assert!(service.start().is_err());
}

#[test]
fn test_agent_counts_reach_trace_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = service_config("trace", dir.path());
    let endpoint = config.endpoint.clone();
    let service = Service::new("logger", LoggerService::new(config).unwrap());
    service.start().unwrap();

    let session = RpcClient::connect(&endpoint, Duration::from_secs(5))
        .unwrap()
        .create_session()
        .unwrap();
    let session_id = session.session_id();

    let module = ModuleIdentity {
        base: 0x1000_0000,
        size: 0x4000,
        checksum: 0xC0DE,
        time_date_stamp: 0x5EED,
    };
    let agent = BasicBlockEntry::new(Some(Box::new(session)));
    let mut data = IndexedFrequencyData::new(BASIC_BLOCK_ENTRY_AGENT_ID, data_type::BASIC_BLOCK_ENTRY, 1, 5);
    unsafe {
        agent.on_process_attach(&mut data, module).unwrap();
        for bb in [0, 2, 2, 4, 2] {
            BasicBlockEntry::on_basic_block_entry(&data, bb);
        }
    }
    agent.on_process_detach().unwrap();
    drop(agent);

    let mut control = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
    control.write("agent finished").unwrap();
    control.stop().unwrap();
    service.join().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);

    let pid = std::process::id();
    let path = dir.path().join(format!("trace-{pid}-{session_id}.bin"));
    let reader = TraceFileReader::open(&path).unwrap();
    assert_eq!(reader.header().process_id, pid);

    let segments = reader.segments().unwrap();
    let record = segments
        .iter()
        .flat_map(|segment| segment.records.iter())
        .find(|record| record.record_type() == Some(RecordType::IndexedFrequency))
        .unwrap();
    let header = IndexedFrequencyHeader::read_from(record.payload).unwrap();
    assert_eq!(header.module, module);
    let counters: Vec<u32> = (0..5).map(|i| header.counter(record.payload, i).unwrap()).collect();
    assert_eq!(counters, vec![1, 0, 3, 0, 1]);

    let log = std::fs::read_to_string(dir.path().join("service.log")).unwrap();
    assert!(log.contains(&format!("[{pid}] agent finished")));
}

#[test]
fn test_session_buffers_span_whole_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        block_size: 1024,
        max_buffer_size: 4096,
        ..service_config("blocks", dir.path())
    };
    let endpoint = config.endpoint.clone();
    let service = Service::new("logger", LoggerService::new(config).unwrap());
    service.start().unwrap();

    let mut session = RpcClient::connect(&endpoint, Duration::from_secs(5))
        .unwrap()
        .create_session()
        .unwrap();
    assert_eq!(session.block_size(), 1024);
    assert_eq!(session.allocate_buffer(100).unwrap().capacity(), 1024);
    assert_eq!(session.allocate_buffer(1025).unwrap().capacity(), 2048);
    assert!(session.can_allocate(4096));
    assert!(!session.can_allocate(4000 + 1024));
    assert!(session.allocate_buffer(4097).is_err());
    session.close().unwrap();
    drop(session);

    RpcClient::connect(&endpoint, Duration::from_secs(5))
        .unwrap()
        .stop()
        .unwrap();
    service.join().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[test]
fn test_backend_interrupt_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LoggerService::new(service_config("direct", dir.path())).unwrap();
    backend.start(hotpatch::service::StopHandle::detached()).unwrap();
    backend.interrupt();
    backend.interrupt();
    backend.join().unwrap();
}

#[test]
fn test_stack_trace_lists_callers_in_order() {
    let frames: Vec<SymbolInfo> = ["FunctionA", "FunctionB", "FunctionC"]
        .iter()
        .enumerate()
        .map(|(i, name)| SymbolInfo {
            address: 0x0040_1000 + 0x100 * i as u64,
            symbol: Some(name.to_string()),
            displacement: 0x1C,
            file: Some("chain.cc".into()),
            line: Some(10 + i as u32),
        })
        .collect();
    let text = format_stack_trace(&frames);
    let a = text.find("FunctionA").unwrap();
    let b = text.find("FunctionB").unwrap();
    let c = text.find("FunctionC").unwrap();
    assert!(a < b && b < c);
    assert!(text.starts_with("#0 0x00401000 in FunctionA+0x1c chain.cc:10\n"));
}
