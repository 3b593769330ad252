use cloudio_crypto::{recover_secret, split_secret, EntityCrypto, Nonce, SymmetricKey};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_seal(bencher: divan::Bencher, size: usize) {
    let entity = EntityCrypto::new(SymmetricKey::generate());
    let nonce = Nonce::random();
    let aad = [0xABu8; 96];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            entity
                .seal(divan::black_box(&data), &nonce, divan::black_box(&aad))
                .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_open(bencher: divan::Bencher, size: usize) {
    let entity = EntityCrypto::new(SymmetricKey::generate());
    let nonce = Nonce::random();
    let aad = [0xABu8; 96];
    let sealed = entity.seal(&make_data(size), &nonce, &aad).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            entity
                .open(divan::black_box(&sealed), &nonce, divan::black_box(&aad))
                .unwrap()
        });
}

// Shares are 2t + 1 so each split is just recoverable by a majority.
#[divan::bench(args = [1, 2, 10, 63])]
fn bench_split(bencher: divan::Bencher, threshold: u8) {
    let secret = [0x5Au8; 32];
    bencher.bench(|| split_secret(divan::black_box(&secret), threshold, 2 * threshold + 1).unwrap());
}

#[divan::bench(args = [1, 2, 10, 63])]
fn bench_recover(bencher: divan::Bencher, threshold: u8) {
    let split = split_secret(&[0x5Au8; 32], threshold, 2 * threshold + 1).unwrap();
    bencher.bench(|| recover_secret(divan::black_box(&split)).unwrap());
}

fn main() {
    divan::main();
}
