use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use camino::Utf8PathBuf;

use thredds_mirror::definition::{CatalogueSource, DownloadDefinition, Output, OutputType};
use thredds_mirror::domain::{unique_dataset_id, Checksum, Status};
use thredds_mirror::error::MirrorError;
use thredds_mirror::metadata::{DatasetMetadata, JsonMetadataStore, MetadataStore};
use thredds_mirror::notify::Notifier;
use thredds_mirror::reconcile::{DownloadOutput, Reconciler, RunOptions};
use thredds_mirror::scan::NetcdfScanner;
use thredds_mirror::sink::FileSink;

const DEF_ID: &str = "downloads__gbr4_v2";

const T10: &str = "2018-11-05T12:46:10Z";
const T11: &str = "2018-12-02T14:05:34Z";
const T12: &str = "2018-12-10T08:52:59Z";
const T01: &str = "2019-01-19T01:09:58Z";
const T12B: &str = "2019-01-08T08:52:59Z";
const T01B: &str = "2019-01-20T01:09:58Z";
const T02: &str = "2019-01-20T02:09:58Z";

const F10: &str = "gbr4_simple_2018-10.nc";
const F11: &str = "gbr4_simple_2018-11.nc";
const F12: &str = "gbr4_simple_2018-12.nc";
const F01: &str = "gbr4_simple_2019-01.nc";
const F02: &str = "gbr4_simple_2019-02.nc";

#[derive(Default)]
struct RecordingNotifier {
    corrupted: Mutex<Vec<String>>,
    disk_full: Mutex<Vec<String>>,
    definitions: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn disk_full(&self, file_uri: &str, _file_size_mb: f64, _free_space_mb: f64) {
        self.disk_full.lock().unwrap().push(file_uri.to_string());
    }

    fn corrupted_file(&self, file_uri: &str, _error_message: &str) {
        self.corrupted.lock().unwrap().push(file_uri.to_string());
    }

    fn definition_complete(&self, definition_id: &str, _output: &DownloadOutput) {
        self.definitions
            .lock()
            .unwrap()
            .push(definition_id.to_string());
    }

    fn run_complete(&self, _outputs: &BTreeMap<String, DownloadOutput>) {}
}

struct Harness {
    _temp: tempfile::TempDir,
    root: PathBuf,
    definition: DownloadDefinition,
    store: JsonMetadataStore,
}

impl Harness {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        for dir in ["catalog/data", "mirror", "downloads", "metadata"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }

        let definition = DownloadDefinition {
            id: DEF_ID.to_string(),
            enabled: true,
            catalogue_urls: vec![CatalogueSource {
                catalogue_url: format!("file://{}/catalog/catalog.xml", root.display()),
                sub_directory: None,
                filename_regex: None,
            }],
            filename_regex: None,
            files: None,
            output: Some(Output {
                output_type: OutputType::File,
                destination: format!("file://{}/mirror", root.display()),
                download_dir: Utf8PathBuf::from_path_buf(root.join("downloads")).unwrap(),
            }),
        };
        let store =
            JsonMetadataStore::new(Utf8PathBuf::from_path_buf(root.join("metadata")).unwrap());

        Self {
            _temp: temp,
            root,
            definition,
            store,
        }
    }

    fn write_source(&self, filename: &str, content: &[u8]) {
        let mut bytes = b"CDF\x01".to_vec();
        bytes.extend_from_slice(content);
        fs::write(self.root.join("catalog/data").join(filename), bytes).unwrap();
    }

    fn write_raw_source(&self, filename: &str, content: &[u8]) {
        fs::write(self.root.join("catalog/data").join(filename), content).unwrap();
    }

    /// Write `catalog.xml` advertising the given `(filename, modified)`
    /// entries. The advertised size is the real size of the staged file.
    fn publish_catalogue(&self, entries: &[(&str, &str)]) {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <catalog name=\"fx3\">\n\
             \x20\x20<service name=\"http\" serviceType=\"HTTPServer\" base=\"\"/>\n\
             \x20\x20<dataset name=\"gbr4_v2\">\n\
             \x20\x20\x20\x20<metadata inherited=\"true\"><serviceName>http</serviceName></metadata>\n",
        );
        for (filename, modified) in entries {
            let size = fs::metadata(self.root.join("catalog/data").join(filename))
                .map(|meta| meta.len())
                .unwrap_or(16);
            xml.push_str(&format!(
                "    <dataset name=\"{filename}\" ID=\"fx3/gbr4_v2/{filename}\" urlPath=\"data/{filename}\">\n\
                 \x20\x20\x20\x20\x20\x20<dataSize units=\"bytes\">{size}</dataSize>\n\
                 \x20\x20\x20\x20\x20\x20<date type=\"modified\">{modified}</date>\n\
                 \x20\x20\x20\x20</dataset>\n"
            ));
        }
        xml.push_str("  </dataset>\n</catalog>\n");
        fs::write(self.root.join("catalog/catalog.xml"), xml).unwrap();
    }

    fn reconcile(&self) -> DownloadOutput {
        self.reconcile_with(RunOptions::default(), &RecordingNotifier::default())
            .unwrap()
    }

    fn reconcile_with(
        &self,
        options: RunOptions,
        notifier: &RecordingNotifier,
    ) -> Result<DownloadOutput, MirrorError> {
        let sink = FileSink;
        let scanner = NetcdfScanner::new();
        let reconciler = Reconciler::new(
            &self.definition,
            &self.store,
            &sink,
            &scanner,
            notifier,
            options,
        );
        reconciler.reconcile()
    }

    fn records(&self) -> BTreeMap<String, DatasetMetadata> {
        self.store
            .list(DEF_ID)
            .unwrap()
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect()
    }

    fn record(&self, filename: &str) -> DatasetMetadata {
        let key = key_for(filename);
        self.records().remove(&key).expect("record present")
    }

    fn dest_path(&self, filename: &str) -> PathBuf {
        self.root.join("mirror").join(filename)
    }

    fn downloads_dir_is_empty(&self) -> bool {
        fs::read_dir(self.root.join("downloads"))
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }
}

fn key_for(filename: &str) -> String {
    unique_dataset_id(DEF_ID, &format!("fx3/gbr4_v2/{filename}"))
}

fn initial_mirror() -> Harness {
    let harness = Harness::new();
    harness.write_source(F10, b"october 2018 hydrodynamics");
    harness.write_source(F11, b"november 2018 hydrodynamics");
    harness.write_source(F12, b"december 2018 hydrodynamics");
    harness.write_source(F01, b"january 2019 hydrodynamics");
    harness.publish_catalogue(&[(F10, T10), (F11, T11), (F12, T12), (F01, T01)]);
    harness
}

#[test]
fn scenario_a_initial_download_of_four_files() {
    let harness = initial_mirror();
    let output = harness.reconcile();

    assert_eq!(output.success.len(), 4);
    assert!(output.warnings.is_empty());
    assert!(output.errors.is_empty());

    let records = harness.records();
    assert_eq!(records.len(), 4);
    for filename in [F10, F11, F12, F01] {
        let record = &records[&key_for(filename)];
        assert_eq!(record.status, Status::Valid);
        assert!(harness.dest_path(filename).exists());
        // The sink object hashes to the persisted checksum.
        let on_disk = Checksum::md5_of_file(&harness.dest_path(filename)).unwrap();
        assert_eq!(record.checksum.as_ref(), Some(&on_disk));
        assert!(record.last_downloaded >= record.last_modified);
    }
    assert!(harness.downloads_dir_is_empty());
}

#[test]
fn scenario_b_partial_update() {
    let harness = initial_mirror();
    harness.reconcile();
    let before = harness.records();
    let mtime_10 = fs::metadata(harness.dest_path(F10)).unwrap().modified().unwrap();
    let mtime_01 = fs::metadata(harness.dest_path(F01)).unwrap().modified().unwrap();

    // Keep the two runs on distinct lastDownloaded milliseconds.
    std::thread::sleep(std::time::Duration::from_millis(5));

    // 12 changes content, 01 changes date only, 02 is new.
    harness.write_source(F12, b"december 2018 hydrodynamics, reprocessed");
    harness.write_source(F02, b"february 2019 hydrodynamics");
    harness.publish_catalogue(&[(F10, T10), (F11, T11), (F12, T12B), (F01, T01B), (F02, T02)]);
    let output = harness.reconcile();

    assert_eq!(output.success.len(), 2);
    let success_uris: Vec<_> = output.success.iter().map(|r| r.file_uri.clone()).collect();
    assert!(success_uris.iter().any(|uri| uri.ends_with(F12)));
    assert!(success_uris.iter().any(|uri| uri.ends_with(F02)));

    let after = harness.records();
    // 10 and 11 untouched, on disk and in the index.
    assert_eq!(after[&key_for(F10)], before[&key_for(F10)]);
    assert_eq!(after[&key_for(F11)], before[&key_for(F11)]);
    assert_eq!(
        fs::metadata(harness.dest_path(F10)).unwrap().modified().unwrap(),
        mtime_10
    );

    // 12 re-written with a new checksum.
    assert_ne!(after[&key_for(F12)].checksum, before[&key_for(F12)].checksum);

    // 01: dates advanced, file untouched.
    let old_01 = &before[&key_for(F01)];
    let new_01 = &after[&key_for(F01)];
    assert_eq!(new_01.checksum, old_01.checksum);
    assert!(new_01.last_modified > old_01.last_modified);
    assert!(new_01.last_downloaded > old_01.last_downloaded);
    assert_eq!(
        fs::metadata(harness.dest_path(F01)).unwrap().modified().unwrap(),
        mtime_01
    );

    // 02 is a fresh record.
    assert_eq!(after[&key_for(F02)].status, Status::Valid);
    assert!(harness.dest_path(F02).exists());
}

#[test]
fn scenario_c_deleted_local_files_with_unchanged_catalogue() {
    let harness = initial_mirror();
    harness.reconcile();
    let before = harness.records();

    for filename in [F11, F12, F01] {
        fs::remove_file(harness.dest_path(filename)).unwrap();
    }
    let output = harness.reconcile();

    assert!(output.success.is_empty());
    let after = harness.records();
    assert_eq!(after[&key_for(F10)].status, Status::Valid);
    for filename in [F11, F12, F01] {
        let old = &before[&key_for(filename)];
        let new = &after[&key_for(filename)];
        assert_eq!(new.status, Status::Deleted);
        // Everything except the status is preserved.
        assert_eq!(new.checksum, old.checksum);
        assert_eq!(new.last_modified, old.last_modified);
        assert_eq!(new.last_downloaded, old.last_downloaded);
    }
}

#[test]
fn scenario_d_resurrection_only_on_true_content_change() {
    let harness = initial_mirror();
    harness.reconcile();
    for filename in [F11, F12, F01] {
        fs::remove_file(harness.dest_path(filename)).unwrap();
    }
    harness.reconcile();

    // 12 truly changes, 01 re-advertises identical content, 02 is new.
    harness.write_source(F12, b"december 2018 hydrodynamics, reprocessed");
    harness.write_source(F02, b"february 2019 hydrodynamics");
    harness.publish_catalogue(&[(F10, T10), (F11, T11), (F12, T12B), (F01, T01B), (F02, T02)]);
    let output = harness.reconcile();

    let after = harness.records();
    // A DELETED record only returns to VALID through a fresh download.
    assert_eq!(after[&key_for(F12)].status, Status::Valid);
    assert!(harness.dest_path(F12).exists());

    // Identical content keeps the tombstone: dates advance, file stays gone.
    let record_01 = &after[&key_for(F01)];
    assert_eq!(record_01.status, Status::Deleted);
    assert!(record_01.last_modified > before_timestamp(T01));
    assert!(!harness.dest_path(F01).exists());

    assert_eq!(after[&key_for(F02)].status, Status::Valid);
    assert_eq!(output.success.len(), 2);
}

fn before_timestamp(iso: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(iso)
        .unwrap()
        .timestamp_millis()
        - 1
}

#[test]
fn scenario_e_legacy_primary_key_is_left_untouched() {
    let harness = Harness::new();
    harness.write_source(F10, b"october 2018 hydrodynamics");
    harness.publish_catalogue(&[(F10, T10)]);

    // A record from before key sanitisation: raw dot in the key tail. It
    // advertises an up-to-date lastModified, but the canonical lookup can
    // not see it.
    let legacy = DatasetMetadata {
        id: format!("{DEF_ID}/fx3_gbr4_v2_gbr4_simple_2018-10.nc"),
        definition_id: DEF_ID.to_string(),
        dataset_id: format!("fx3/gbr4_v2/{F10}"),
        file_uri: format!("file:///old-mirror/{F10}"),
        checksum: Some("MD5:00000000000000000000000000000000".parse().unwrap()),
        status: Status::Valid,
        last_modified: chrono::DateTime::parse_from_rfc3339(T10)
            .unwrap()
            .timestamp_millis(),
        last_downloaded: chrono::DateTime::parse_from_rfc3339(T10)
            .unwrap()
            .timestamp_millis(),
        error_message: None,
        stacktrace: Vec::new(),
        attributes: serde_json::Value::Null,
    };
    harness.store.upsert(&legacy).unwrap();

    let output = harness.reconcile();
    assert_eq!(output.success.len(), 1);

    let records = harness.records();
    assert_eq!(records.len(), 2);
    // Fresh record under the canonical key.
    let canonical = &records[&key_for(F10)];
    assert_eq!(canonical.status, Status::Valid);
    // Legacy record byte-for-byte untouched.
    assert_eq!(records[&legacy.id], legacy);
}

#[test]
fn scenario_f_corrupted_download() {
    let harness = Harness::new();
    harness.write_raw_source(F10, b"<html>this is no dataset</html>");
    harness.publish_catalogue(&[(F10, T10)]);

    let notifier = RecordingNotifier::default();
    let output = harness
        .reconcile_with(RunOptions::default(), &notifier)
        .unwrap();

    assert!(output.success.is_empty());
    assert_eq!(output.warnings.len(), 1);

    let record = harness.record(F10);
    assert_eq!(record.status, Status::Corrupted);
    assert!(record.error_message.is_some());
    assert!(!harness.dest_path(F10).exists());
    assert!(harness.downloads_dir_is_empty());
    assert_eq!(notifier.corrupted.lock().unwrap().len(), 1);
    assert_eq!(notifier.definitions.lock().unwrap().as_slice(), [DEF_ID]);
}

#[test]
fn corrupted_record_is_a_tombstone_until_the_source_changes() {
    let harness = Harness::new();
    harness.write_raw_source(F10, b"<html>this is no dataset</html>");
    harness.publish_catalogue(&[(F10, T10)]);
    harness.reconcile();
    assert_eq!(harness.record(F10).status, Status::Corrupted);

    // Same advertised date: nothing happens, not even a sink probe flip.
    let output = harness.reconcile();
    assert!(output.is_empty());
    assert_eq!(harness.record(F10).status, Status::Corrupted);

    // A newer advertised date with a repaired file resurrects it.
    harness.write_source(F10, b"october 2018 hydrodynamics");
    harness.publish_catalogue(&[(F10, T11)]);
    let output = harness.reconcile();
    assert_eq!(output.success.len(), 1);
    assert_eq!(harness.record(F10).status, Status::Valid);
}

#[test]
fn limit_zero_does_nothing() {
    let harness = initial_mirror();
    let notifier = RecordingNotifier::default();
    let output = harness
        .reconcile_with(
            RunOptions {
                dry_run: false,
                limit: 0,
            },
            &notifier,
        )
        .unwrap();

    assert!(output.is_empty());
    assert!(harness.records().is_empty());
    assert!(!harness.dest_path(F10).exists());
    assert!(notifier.definitions.lock().unwrap().is_empty());
}

#[test]
fn positive_limit_caps_successful_downloads() {
    let harness = initial_mirror();
    let output = harness
        .reconcile_with(
            RunOptions {
                dry_run: false,
                limit: 2,
            },
            &RecordingNotifier::default(),
        )
        .unwrap();
    assert_eq!(output.success.len(), 2);
    assert_eq!(harness.records().len(), 2);

    // The rest arrives on the next unlimited run.
    let output = harness.reconcile();
    assert_eq!(output.success.len(), 2);
    assert_eq!(harness.records().len(), 4);
}

#[test]
fn unchanged_content_does_not_consume_the_limit_quota() {
    let harness = initial_mirror();
    harness.reconcile();

    // All four re-advertised with newer dates but identical content, plus
    // one genuinely new file. With limit 1 the new file must still fit.
    harness.write_source(F02, b"february 2019 hydrodynamics");
    harness.publish_catalogue(&[
        (F10, T01B),
        (F11, T01B),
        (F12, T01B),
        (F01, T01B),
        (F02, T02),
    ]);
    let output = harness
        .reconcile_with(
            RunOptions {
                dry_run: false,
                limit: 1,
            },
            &RecordingNotifier::default(),
        )
        .unwrap();

    assert_eq!(output.success.len(), 1);
    assert!(output.success[0].file_uri.ends_with(F02));
}

#[test]
fn two_runs_over_stable_inputs_are_idempotent() {
    let harness = initial_mirror();
    harness.reconcile();
    let first = harness.records();

    let output = harness.reconcile();
    assert!(output.success.is_empty());
    assert_eq!(harness.records(), first);
}

#[test]
fn dry_run_touches_nothing() {
    let harness = initial_mirror();
    let notifier = RecordingNotifier::default();
    let output = harness
        .reconcile_with(
            RunOptions {
                dry_run: true,
                limit: -1,
            },
            &notifier,
        )
        .unwrap();

    assert!(output.is_empty());
    assert!(harness.records().is_empty());
    assert!(!harness.dest_path(F10).exists());
    assert!(harness.downloads_dir_is_empty());
    assert!(notifier.definitions.lock().unwrap().is_empty());
}

#[test]
fn archive_filename_drops_extension_in_destination() {
    let harness = Harness::new();
    // Stage a gzipped dataset file.
    let mut payload = b"CDF\x01compressed october data".to_vec();
    payload.extend_from_slice(&[0u8; 64]);
    let gz_path = harness.root.join("catalog/data").join("gbr4_simple_2018-10.nc.gz");
    {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(
            fs::File::create(&gz_path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();
    }
    harness.publish_catalogue(&[("gbr4_simple_2018-10.nc.gz", T10)]);

    let output = harness.reconcile();
    assert_eq!(output.success.len(), 1);
    let record = output.success[0].clone();
    assert!(record.file_uri.ends_with("gbr4_simple_2018-10.nc"));
    assert!(!record.file_uri.ends_with(".gz"));
    assert!(harness.dest_path(F10).exists());
    assert_eq!(
        fs::read(harness.dest_path(F10)).unwrap(),
        payload,
        "the mirrored object is the expanded payload"
    );
    assert!(harness.downloads_dir_is_empty());
}

#[test]
fn transport_failure_is_a_per_file_error_and_the_run_continues() {
    let harness = Harness::new();
    harness.write_source(F11, b"november 2018 hydrodynamics");
    // F10 is advertised but the file is missing on the server side.
    harness.publish_catalogue(&[(F10, T10), (F11, T11)]);

    let output = harness.reconcile();
    assert_eq!(output.errors.len(), 1);
    assert_eq!(output.success.len(), 1);
    assert!(harness.dest_path(F11).exists());
    assert!(!harness.dest_path(F10).exists());
}
