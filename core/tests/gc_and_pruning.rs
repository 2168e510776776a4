// Garbage collection over the traceback arenas and dynamic-beam
// behaviour under the max-model histogram pruning, exercised on looping
// networks that keep the decoder busy for tens of frames.

use librecog_core::math::LZERO_F;
use librecog_core::*;
use std::sync::Arc;

const LN_2PI: f32 = 1.837_877_1;

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

fn one_shot_trans() -> Vec<Vec<f32>> {
    let mut t = vec![vec![LZERO_F; 3]; 3];
    t[0][1] = 0.0;
    t[1][2] = 0.0;
    t
}

fn looping_trans(stay: f32) -> Vec<Vec<f32>> {
    let mut t = vec![vec![LZERO_F; 3]; 3];
    t[0][1] = 0.0;
    t[1][1] = stay.ln();
    t[1][2] = (1.0 - stay).ln();
    t
}

/// A single word "A" on a loop, so word-end records accumulate frame after
/// frame: sil -> ctx -> a -> we(A) -> ctx2 -> (a | end).
fn looping_word_system(cfg: Config) -> Decoder {
    let mut dict = Dictionary::new();
    let a = dict.add_pron("A", Some("A"), &["a"], 0.0);
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);

    let mut lm = BigramLm::uniform(2);
    lm.set_unigram(a, -0.5);
    lm.set_unigram(send, 0.0);
    let lm = Arc::new(lm);

    let mut hmms = HmmSet::new();
    let h_sil = hmms.add_hmm("sil", one_shot_trans(), vec![0], "sil").unwrap();
    let h_a = hmms.add_hmm("a", looping_trans(0.5), vec![0], "a").unwrap();

    let mut net = LexNet::new(6);
    // word model carries a lookahead entry covering its only word end
    let la_idx = net.lmla.push_range(a, a);
    let m_sil = net.add_node(0, NodeKind::Model(h_sil), 0);
    let ctx = net.add_node(1, NodeKind::Context, 0);
    let m_a = net.add_node(2, NodeKind::Model(h_a), la_idx);
    let we_a = net.add_node(3, NodeKind::WordEnd(a), 0);
    let ctx2 = net.add_node(4, NodeKind::Context, 0);
    let end = net.add_node(5, NodeKind::Context, 0);
    net.link(m_sil, ctx);
    net.link(ctx, m_a);
    net.link(m_a, we_a);
    net.link(we_a, ctx2);
    net.link(ctx2, m_a); // word loop, back into an earlier layer
    net.link(ctx2, end);
    net.start = m_sil;
    net.end = end;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 0;
    net.layers.we = 3;
    net.layers.we_update = 4;
    net.layers.ab = 5;
    net.layers.by = 1;
    net.layers.zs = 5;
    net.layers.sa = 5;
    net.finish(&hmms).unwrap();

    let am = AcousticModel::from_states(vec![gauss_state(0.5)], 1, false).unwrap();
    Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict,
        cfg,
        DecoderOpts::default(),
    )
    .unwrap()
}

#[test]
fn collector_reclaims_exactly_the_unreachable_records() {
    let mut dec = looping_word_system(Config {
        gc_freq: 0, // manual collection only
        ..Config::default()
    });
    dec.init(BeamParams::default());
    let frames: Vec<Observation> = (0..12).map(|_| obs(0.5)).collect();
    for f in 0..10 {
        dec.process_frame(&frames[f..(f + 3).min(frames.len())], None)
            .unwrap();
        dec.check_invariants().unwrap();
    }
    let before = dec.traceback();
    assert!(!before.labels.is_empty(), "the word loop must emit words");

    // collect to a clean state: everything live is reachable
    dec.collect_garbage();
    let baseline = dec.wordend_arena_stats();

    let _ = dec.inject_unreachable_wordend();
    let _ = dec.inject_unreachable_wordend();
    assert_eq!(dec.wordend_arena_stats().0, baseline.0 + 2);

    // the injected records are unreachable and must go; nothing else moves
    dec.collect_garbage();
    let swept = dec.wordend_arena_stats();
    assert_eq!(swept.0, baseline.0, "live count returns to the baseline");
    assert!(swept.1 >= baseline.1, "the injected slots are back on the free list");

    // a second collection with no intervening propagation reclaims nothing
    dec.collect_garbage();
    assert_eq!(dec.wordend_arena_stats(), swept);

    // every surviving traceback chain is still walkable
    let after = dec.traceback();
    assert_eq!(before, after);
}

#[test]
fn periodic_collection_keeps_decoding_sound() {
    let mut dec = looping_word_system(Config {
        gc_freq: 3,
        ..Config::default()
    });
    dec.init(BeamParams::default());
    let frames: Vec<Observation> = (0..20).map(|_| obs(0.5)).collect();
    for f in 0..18 {
        dec.process_frame(&frames[f..(f + 2).min(frames.len())], None)
            .unwrap();
        dec.check_invariants().unwrap();
    }
    assert!(dec.best_score() > LZERO_F);
    assert!(!dec.traceback().labels.is_empty());
}

/// Eight parallel looping models with spread means: the histogram pruning
/// must tighten the beam down to its floor while over budget, then relax
/// it multiplicatively once the excess instances have died off.
fn parallel_models_system() -> Decoder {
    let mut dict = Dictionary::new();
    let send = dict.add_pron("</s>", None, &["sil"], 0.0);
    let dict = Arc::new(dict);
    let lm = Arc::new(BigramLm::uniform(1));

    let mut hmms = HmmSet::new();
    let h_sil = hmms.add_hmm("sil", one_shot_trans(), vec![0], "sil").unwrap();
    let mut models = Vec::new();
    for i in 0..8u32 {
        let h = hmms
            .add_hmm(
                &format!("m{}", i),
                looping_trans(0.9),
                vec![i + 1],
                &format!("p{}", i),
            )
            .unwrap();
        models.push(h);
    }

    let mut net = LexNet::new(4);
    let m_sil = net.add_node(0, NodeKind::Model(h_sil), 0);
    let ctx = net.add_node(1, NodeKind::Context, 0);
    let sink = net.add_node(3, NodeKind::Context, 0);
    net.link(m_sil, ctx);
    for &h in &models {
        let m = net.add_node(2, NodeKind::Model(h), 0);
        net.link(ctx, m);
        net.link(m, sink);
    }
    net.start = m_sil;
    net.end = sink;
    net.end_pron = send;
    net.start_pron = send;
    net.layers.sil = 0;
    net.layers.we = 3;
    net.layers.we_update = 3;
    net.layers.ab = 3;
    net.layers.by = 1;
    net.layers.zs = 3;
    net.layers.sa = 3;
    net.finish(&hmms).unwrap();

    // state 0 is silence at the observed value; model i sits 2i away
    let mut states = vec![gauss_state(0.0)];
    for i in 0..8 {
        states.push(gauss_state(2.0 * i as f32));
    }
    let am = AcousticModel::from_states(states, 1, false).unwrap();
    Decoder::new(
        am,
        Arc::new(hmms),
        lm,
        Arc::new(net),
        dict,
        Config {
            max_ln_beam_floor: 0.2,
            ..Config::default()
        },
        DecoderOpts::default(),
    )
    .unwrap()
}

#[test]
fn histogram_pruning_tightens_then_relaxes_the_beam() {
    let mut dec = parallel_models_system();
    let beam = 50.0f32;
    dec.init(BeamParams {
        beam_width: beam,
        max_model: 3,
        ..BeamParams::default()
    });

    let mut min_beam = beam;
    let mut final_beam = beam;
    for _ in 0..30 {
        dec.process_frame(&[obs(0.0)], None).unwrap();
        dec.check_invariants().unwrap();
        let w = dec.cur_beam_width();
        min_beam = min_beam.min(w);
        final_beam = w;
    }

    let floor = 0.2 * beam;
    assert!(min_beam < beam, "the beam never tightened");
    assert!(
        min_beam >= floor - 1e-3,
        "the beam fell below its floor: {}",
        min_beam
    );
    assert!(
        final_beam > min_beam + 1.0,
        "the beam never relaxed after the excess died off: min {} final {}",
        min_beam,
        final_beam
    );
    assert!(dec.best_score() > LZERO_F, "the best path must survive");
}

#[test]
fn beam_relaxation_is_capped_at_the_configured_width() {
    let mut dec = parallel_models_system();
    dec.init(BeamParams {
        beam_width: 50.0,
        max_model: 100, // never over budget
        ..BeamParams::default()
    });
    for _ in 0..5 {
        dec.process_frame(&[obs(0.0)], None).unwrap();
        assert!(dec.cur_beam_width() <= 50.0 + 1e-6);
    }
}
