// End-to-end decoding scenarios on miniature hand-built systems:
// single-model silence, a two-word choice with lattice generation and
// confusion-network clustering, beam pruning between competing paths, and
// the silence-dictionary pronunciation variants.
//
// All systems use one-dimensional unit-variance Gaussians so expected
// scores can be written down in closed form.

use librecog_core::math::LZERO_F;
use librecog_core::*;
use std::sync::Arc;

const LN_2PI: f32 = 1.837_877_1;

/// Unit-variance single-Gaussian state centred on `mean`; the log output
/// probability at the mean is -0.5 * ln(2*pi).
fn gauss_state(mean: f32) -> GmmState {
    GmmState {
        mixtures: vec![Mixture {
            log_weight: 0.0,
            g_const: LN_2PI,
            mean: vec![mean],
            inv_var: vec![1.0],
        }],
    }
}

fn obs(x: f32) -> Observation {
    Observation::new(vec![x])
}

/// 3-state model (one emitting) that consumes exactly one frame.
fn one_shot_trans() -> Vec<Vec<f32>> {
    let mut t = vec![vec![LZERO_F; 3]; 3];
    t[0][1] = 0.0;
    t[1][2] = 0.0;
    t
}

/// One-emitting-state tee model: entry goes to the state or directly to
/// the exit.
fn tee_trans(tee: f32) -> Vec<Vec<f32>> {
    let mut t = one_shot_trans();
    t[0][2] = tee;
    t
}

// ---------------------------------------------------------------------
// scenario: pure silence through a single tee model

fn silence_system() -> (Decoder, Arc<Dictionary>) {
    let mut dict = Dictionary::new();
    let sil = dict.add_pron("<sil>", None, &["sil"], 0.0);
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let _ = sil;
    dict.build_index().unwrap();
    let dict = Arc::new(dict);

    let lm = Arc::new(BigramLm::uniform(2));

    let mut hmms = HmmSet::new();
    let h = hmms.add_hmm("sil", tee_trans(-0.7), vec![0], "sil").unwrap();

    let mut net = LexNet::new(2);
    let m = net.add_node(0, NodeKind::Model(h), 0);
    let end = net.add_node(1, NodeKind::Context, 0);
    net.link(m, end);
    net.start = m;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 0;
    net.layers.we = 1;
    net.layers.we_update = 1;
    net.layers.ab = 1;
    net.layers.by = 1;
    net.layers.zs = 1;
    net.layers.sa = 1;
    net.finish(&hmms).unwrap();

    let am = AcousticModel::from_states(vec![gauss_state(0.0)], 1, false).unwrap();
    let dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict.clone(),
        Config::default(),
        DecoderOpts::default(),
    )
    .unwrap();
    (dec, dict)
}

#[test]
fn pure_silence_yields_empty_transcription_and_one_arc() {
    let (mut dec, _dict) = silence_system();
    dec.init(BeamParams::default());
    assert_eq!(dec.n_active(), 1, "only the seeded start node is live");

    dec.process_frame(&[obs(0.3)], None).unwrap();
    dec.check_invariants().unwrap();

    let trans = dec.traceback();
    assert!(trans.labels.is_empty(), "silence words carry no output symbol");

    let lat = dec.lattice_traceback().unwrap();
    assert_eq!(lat.arcs.len(), 1);
    assert_eq!(lat.nodes.len(), 2);
    // arc score = frame log likelihood (acScale = 1)
    let expect = -0.5 * (LN_2PI + 0.3 * 0.3);
    assert!(
        (lat.arcs[0].aclike - expect as f64).abs() < 1e-3,
        "aclike {} vs {}",
        lat.arcs[0].aclike,
        expect
    );
}

#[test]
fn tee_transition_exits_on_the_entry_frame() {
    // chain two models: the second is a tee, so a token entering it on
    // frame 2 must reach the network end on frame 2 as well
    let mut dict = Dictionary::new();
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);
    let lm = Arc::new(BigramLm::uniform(1));

    let mut hmms = HmmSet::new();
    let h1 = hmms.add_hmm("a", one_shot_trans(), vec![0], "a").unwrap();
    let h2 = hmms.add_hmm("tee", tee_trans(-0.1), vec![0], "t").unwrap();

    let mut net = LexNet::new(3);
    let m1 = net.add_node(0, NodeKind::Model(h1), 0);
    let m2 = net.add_node(1, NodeKind::Model(h2), 0);
    let end = net.add_node(2, NodeKind::Context, 0);
    net.link(m1, m2);
    net.link(m2, end);
    net.start = m1;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 1;
    net.layers.we = 2;
    net.layers.we_update = 2;
    net.layers.ab = 2;
    net.layers.by = 2;
    net.layers.zs = 2;
    net.layers.sa = 2;
    net.finish(&hmms).unwrap();

    let am = AcousticModel::from_states(vec![gauss_state(0.0)], 1, false).unwrap();
    let mut dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict,
        Config::default(),
        DecoderOpts::default(),
    )
    .unwrap();
    dec.init(BeamParams::default());

    // frame 1: token leaves m1, lands in m2's entry, and via the tee also
    // in m2's exit and the end node on the very same frame
    dec.process_frame(&[obs(0.0), obs(0.0)], None).unwrap();
    dec.check_invariants().unwrap();
    let end_reached = dec.n_active() >= 3;
    assert!(end_reached, "tee exit must activate the end node in frame 1");

    // frame 2: the token that stayed in m2's emitting state exits too
    dec.process_frame(&[obs(0.0)], None).unwrap();
    dec.check_invariants().unwrap();
    assert!(dec.best_score() > LZERO_F);
}

// ---------------------------------------------------------------------
// scenario: two words with identical pronunciations, uniform LM

fn two_word_system(cfg: Config, opts: DecoderOpts) -> (Decoder, Arc<Dictionary>) {
    let mut dict = Dictionary::new();
    let a = dict.add_pron("A", Some("A"), &["a"], 0.0);
    let b = dict.add_pron("B", Some("B"), &["a"], 0.0);
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    dict.build_index().unwrap();
    let dict = Arc::new(dict);

    let mut lm = BigramLm::uniform(3);
    lm.set_unigram(a, 0.5f32.ln());
    lm.set_unigram(b, 0.5f32.ln());
    lm.set_unigram(send, 0.0);
    let lm = Arc::new(lm);

    let mut hmms = HmmSet::new();
    let h_a = hmms.add_hmm("a", one_shot_trans(), vec![0], "a").unwrap();
    let h_sil = hmms.add_hmm("sil", one_shot_trans(), vec![1], "sil").unwrap();

    let mut net = LexNet::new(4);
    let m_a = net.add_node(0, NodeKind::Model(h_a), 0);
    let we_a = net.add_node(1, NodeKind::WordEnd(a), 0);
    let we_b = net.add_node(1, NodeKind::WordEnd(b), 0);
    let m_sil = net.add_node(2, NodeKind::Model(h_sil), 0);
    let end = net.add_node(3, NodeKind::Context, 0);
    net.link(m_a, we_a);
    net.link(m_a, we_b);
    net.link(we_a, m_sil);
    net.link(we_b, m_sil);
    net.link(m_sil, end);
    net.start = m_a;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 2;
    net.layers.we = 1;
    net.layers.we_update = 2;
    net.layers.ab = 3;
    net.layers.by = 0;
    net.layers.zs = 3;
    net.layers.sa = 3;
    net.finish(&hmms).unwrap();

    let am =
        AcousticModel::from_states(vec![gauss_state(0.5), gauss_state(0.5)], 1, false).unwrap();
    let dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict.clone(),
        cfg,
        opts,
    )
    .unwrap();
    (dec, dict)
}

#[test]
fn two_word_choice_splits_the_posterior() {
    let (mut dec, dict) = two_word_system(Config::default(), DecoderOpts::default());
    dec.init(BeamParams::default());

    dec.process_frame(&[obs(0.5), obs(0.5)], None).unwrap();
    dec.check_invariants().unwrap();
    dec.process_frame(&[obs(0.5)], None).unwrap();
    dec.check_invariants().unwrap();

    let trans = dec.traceback();
    assert_eq!(trans.words(), vec!["A"], "tie resolves to the first token");

    let mut lat = dec.lattice_traceback().unwrap();
    lat.check().unwrap();
    // !NULL -> A, !NULL -> B, and a sentence-end arc from each
    assert_eq!(lat.arcs.len(), 4);

    let cfg = Config::default();
    let cn = ConfNet::cluster(&mut lat, &dict, &cfg).unwrap();
    assert!(cn.is_linear());

    let word_cluster = cn
        .iter()
        .find(|c| c.words.iter().any(|w| w.word == "A"))
        .expect("no cluster holds word A");
    assert!(
        word_cluster.words.iter().any(|w| w.word == "B"),
        "A and B must compete in one cluster"
    );
    for w in &word_cluster.words {
        let p = librecog_core::math::log_to_lin(w.post);
        assert!((p - 0.5).abs() < 1e-6, "posterior of {} is {}", w.word, p);
    }
}

#[test]
fn confnet_one_best_matches_decoder_one_best() {
    let (mut dec, dict) = two_word_system(Config::default(), DecoderOpts::default());
    dec.init(BeamParams::default());
    dec.process_frame(&[obs(0.5), obs(0.5)], None).unwrap();
    dec.process_frame(&[obs(0.5)], None).unwrap();

    let decoded: Vec<String> = dec
        .traceback()
        .labels
        .iter()
        .map(|l| l.sym.clone())
        .collect();
    let mut lat = dec.lattice_traceback().unwrap();
    let cfg = Config::default();
    let cn = ConfNet::cluster(&mut lat, &dict, &cfg).unwrap();
    let clustered: Vec<String> = cn
        .transcription(&dict)
        .labels
        .iter()
        .map(|l| l.sym.clone())
        .collect();
    assert_eq!(decoded, clustered);
}

#[test]
fn model_alignment_is_recorded_on_arcs() {
    let opts = DecoderOpts {
        mod_align: true,
        ..DecoderOpts::default()
    };
    let (mut dec, _dict) = two_word_system(Config::default(), opts);
    dec.init(BeamParams::default());
    dec.process_frame(&[obs(0.5), obs(0.5)], None).unwrap();
    dec.process_frame(&[obs(0.5)], None).unwrap();

    let lat = dec.lattice_traceback().unwrap();
    let labelled: Vec<&str> = lat
        .arcs
        .iter()
        .flat_map(|a| a.align.iter().map(|e| e.label.as_str()))
        .collect();
    assert!(labelled.contains(&"a"), "word arcs align to model 'a'");
    for arc in &lat.arcs {
        for e in &arc.align {
            assert!(e.dur >= 0.0);
        }
    }
}

#[test]
fn phone_posteriors_normalise() {
    let opts = DecoderOpts {
        phone_post: true,
        ..DecoderOpts::default()
    };
    let (mut dec, _dict) = two_word_system(Config::default(), opts);
    dec.init(BeamParams::default());
    dec.process_frame(&[obs(0.5), obs(0.5)], None).unwrap();

    let sum = dec
        .phone_posteriors()
        .iter()
        .fold(librecog_core::math::LZERO, |a, &b| {
            librecog_core::math::log_add(a, b)
        });
    assert!(sum.abs() < 1e-6, "posteriors sum to one, got log {}", sum);
}

#[test]
fn observation_dimension_mismatch_is_fatal() {
    let (mut dec, _dict) = two_word_system(Config::default(), DecoderOpts::default());
    dec.init(BeamParams::default());
    let bad = Observation::new(vec![0.5, 0.5]);
    assert!(dec.process_frame(&[bad], None).is_err());
}

// ---------------------------------------------------------------------
// scenario: main beam pruning between two competing paths

fn competing_system() -> (Decoder, Arc<Dictionary>) {
    let mut dict = Dictionary::new();
    let g = dict.add_pron("G", Some("G"), &["g"], 0.0);
    let b = dict.add_pron("B", Some("B"), &["b"], 0.0);
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);

    // cost-free LM so the 0.1 beam separates the paths acoustically
    let mut lm = BigramLm::uniform(3);
    lm.set_unigram(g, 0.0);
    lm.set_unigram(b, 0.0);
    lm.set_unigram(send, 0.0);
    let lm = Arc::new(lm);

    let mut hmms = HmmSet::new();
    let h_sil = hmms.add_hmm("sil", one_shot_trans(), vec![0], "sil").unwrap();
    let h_g = hmms.add_hmm("g", one_shot_trans(), vec![0], "g").unwrap();
    // mean offset sqrt(2): one frame costs exactly 1.0 more
    let h_b = hmms.add_hmm("b", one_shot_trans(), vec![1], "b").unwrap();

    let mut net = LexNet::new(6);
    let m_sil = net.add_node(0, NodeKind::Model(h_sil), 0);
    let ctx = net.add_node(1, NodeKind::Context, 0);
    let m_g = net.add_node(2, NodeKind::Model(h_g), 0);
    let m_b = net.add_node(2, NodeKind::Model(h_b), 0);
    let we_g = net.add_node(3, NodeKind::WordEnd(g), 0);
    let we_b = net.add_node(3, NodeKind::WordEnd(b), 0);
    let m_sil2 = net.add_node(4, NodeKind::Model(h_sil), 0);
    let end = net.add_node(5, NodeKind::Context, 0);
    net.link(m_sil, ctx);
    net.link(ctx, m_g);
    net.link(ctx, m_b);
    net.link(m_g, we_g);
    net.link(m_b, we_b);
    net.link(we_g, m_sil2);
    net.link(we_b, m_sil2);
    net.link(m_sil2, end);
    net.start = m_sil;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 4;
    net.layers.we = 3;
    net.layers.we_update = 4;
    net.layers.ab = 5;
    net.layers.by = 2;
    net.layers.zs = 5;
    net.layers.sa = 5;
    net.finish(&hmms).unwrap();

    let am = AcousticModel::from_states(
        vec![gauss_state(0.0), gauss_state(2.0f32.sqrt())],
        1,
        false,
    )
    .unwrap();
    let dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict.clone(),
        Config::default(),
        DecoderOpts::default(),
    )
    .unwrap();
    (dec, dict)
}

#[test]
fn tight_beam_keeps_only_the_better_path() {
    let (mut dec, _dict) = competing_system();
    dec.init(BeamParams {
        beam_width: 0.1,
        ..BeamParams::default()
    });

    let frames = [obs(0.0), obs(0.0), obs(0.0)];
    dec.process_frame(&frames, None).unwrap();
    dec.process_frame(&frames[1..], None).unwrap();
    dec.process_frame(&frames[2..], None).unwrap();
    dec.check_invariants().unwrap();

    let trans = dec.traceback();
    assert_eq!(trans.words(), vec!["G"]);

    let lat = dec.lattice_traceback().unwrap();
    // only the surviving path fabricates a sentence-end arc
    let final_node = lat
        .nodes
        .iter()
        .position(|n| n.foll.is_empty())
        .unwrap();
    let terminal: Vec<_> = lat
        .arcs
        .iter()
        .filter(|a| a.end as usize == final_node)
        .collect();
    assert_eq!(terminal.len(), 1);
    assert!(!lat.nodes.iter().any(|n| n.word == "B"));
}

#[test]
fn wide_beam_keeps_both_paths() {
    let (mut dec, _dict) = competing_system();
    dec.init(BeamParams::default());
    let frames = [obs(0.0), obs(0.0), obs(0.0)];
    dec.process_frame(&frames, None).unwrap();
    dec.process_frame(&frames[1..], None).unwrap();
    dec.process_frame(&frames[2..], None).unwrap();

    let lat = dec.lattice_traceback().unwrap();
    assert!(lat.nodes.iter().any(|n| n.word == "B"));
}

// ---------------------------------------------------------------------
// scenario: silence dictionary pronunciation variants

fn sil_dict_system(sp_prob: f32) -> (Decoder, Arc<Dictionary>) {
    let mut dict = Dictionary::new();
    let a = dict.add_pron("A", Some("A"), &["a"], 0.0);
    dict.add_silence_variants(a, sp_prob, -1.2);
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);

    let mut lm = BigramLm::uniform(dict.n_prons() as u32);
    lm.set_unigram(a, 0.0);
    lm.set_unigram(send, 0.0);
    let lm = Arc::new(lm);

    let mut hmms = HmmSet::new();
    let h_a = hmms.add_hmm("a", one_shot_trans(), vec![0], "a").unwrap();
    let h_sp = hmms.add_hmm("sp", one_shot_trans(), vec![1], "sp").unwrap();

    let mut net = LexNet::new(5);
    let m_a = net.add_node(0, NodeKind::Model(h_a), 0);
    let we_a = net.add_node(1, NodeKind::WordEnd(a), 0);
    let skip = net.add_node(2, NodeKind::Context, 0);
    let m_sp = net.add_node(3, NodeKind::Model(h_sp), 0);
    let end = net.add_node(4, NodeKind::Context, 0);
    net.link(m_a, we_a);
    net.link(we_a, skip);
    net.link(skip, m_sp);
    net.link(m_sp, end);
    net.start = m_a;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.hmm_sp = Some(h_sp);
    net.layers.sil = 3;
    net.layers.we = 1;
    net.layers.we_update = 3;
    net.layers.ab = 4;
    net.layers.by = 0;
    net.layers.zs = 4;
    net.layers.sa = 4;
    net.layers.sp_skip = Some(2);
    net.finish(&hmms).unwrap();

    let am =
        AcousticModel::from_states(vec![gauss_state(0.5), gauss_state(0.5)], 1, false).unwrap();
    let dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict.clone(),
        Config::default(),
        DecoderOpts::default(),
    )
    .unwrap();
    (dec, dict)
}

#[test]
fn sp_skip_layer_applies_variant_probabilities() {
    let run = |sp_prob: f32| -> f32 {
        let (mut dec, _dict) = sil_dict_system(sp_prob);
        dec.init(BeamParams::default());
        dec.process_frame(&[obs(0.5), obs(0.5)], None).unwrap();
        dec.process_frame(&[obs(0.5)], None).unwrap();
        dec.check_invariants().unwrap();
        assert_eq!(dec.traceback().words(), vec!["A"]);
        dec.best_score()
    };
    let with_penalty = run(-0.3);
    let without = run(0.0);
    assert!(
        (without - with_penalty - 0.3).abs() < 1e-3,
        "sp variant probability must shift the path score: {} vs {}",
        without,
        with_penalty
    );
}

// ---------------------------------------------------------------------
// forced lattice output

#[test]
fn forced_output_builds_a_lattice_without_sentence_end() {
    // stop after one frame: no token has reached the end or the silence
    // layer, so only the forced fallback can produce a lattice
    let (mut dec, _dict) = two_word_system(Config::default(), DecoderOpts::default());
    dec.init(BeamParams::default());
    dec.process_frame(&[obs(0.5)], None).unwrap();

    let lat = dec.lattice_traceback().unwrap();
    assert!(!lat.arcs.is_empty());
    let final_node = lat.nodes.iter().position(|n| n.foll.is_empty()).unwrap();
    assert!(lat.arcs.iter().any(|a| a.end as usize == final_node));
}

#[test]
fn without_forced_output_the_failure_is_reported() {
    let cfg = Config {
        force_lat_out: false,
        ..Config::default()
    };
    let (mut dec, _dict) = two_word_system(cfg, DecoderOpts::default());
    dec.init(BeamParams::default());
    dec.process_frame(&[obs(0.5)], None).unwrap();
    assert!(dec.lattice_traceback().is_err());
}

// ---------------------------------------------------------------------
// hybrid acoustic models

#[test]
fn hybrid_model_decodes_from_posterior_observations() {
    let mut dict = Dictionary::new();
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);
    let lm = Arc::new(BigramLm::uniform(1));

    let mut hmms = HmmSet::new();
    let h = hmms.add_hmm("sil", one_shot_trans(), vec![0], "sil").unwrap();

    let mut net = LexNet::new(2);
    let m = net.add_node(0, NodeKind::Model(h), 0);
    let end = net.add_node(1, NodeKind::Context, 0);
    net.link(m, end);
    net.start = m;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 0;
    net.layers.we = 1;
    net.layers.we_update = 1;
    net.layers.ab = 1;
    net.layers.by = 1;
    net.layers.zs = 1;
    net.layers.sa = 1;
    net.finish(&hmms).unwrap();

    let am = AcousticModel::Hybrid(HybridTable { targets: vec![1] });
    let mut dec = Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict,
        Config::default(),
        DecoderOpts::default(),
    )
    .unwrap();
    dec.init(BeamParams::default());

    // observation carries log posteriors; state 0 reads slot 1
    dec.process_frame(&[Observation::new(vec![-5.0, -0.25])], None)
        .unwrap();
    assert!((dec.best_score() - (-0.25)).abs() < 1e-5);
}
